//! Per-session sample store and quality snapshots

use duet_core::quality::{
    classify_jitter, classify_overall, classify_rtt, overall_score, packet_loss_percent,
    FrameDelayStats, QualitySnapshot, RttStats,
};
use duet_core::stats::HighResSamples;
use duet_core::{
    BitrateReading, BitrateTracker, FrameDelaySample, NetworkState, RttSample, SlidingWindow,
    TelemetryConfig,
};

use crate::prober::Prober;

/// Bounded time series for one call
#[derive(Debug)]
pub struct Telemetry {
    transport_rtt: SlidingWindow<RttSample>,
    probe_rtt: SlidingWindow<RttSample>,
    frame_delay: SlidingWindow<FrameDelaySample>,
    bitrate: BitrateTracker,
    last_bitrate: Option<BitrateReading>,
    network: Option<NetworkState>,
    rtt_stats_window: usize,
    frame_delay_window: usize,
    loss_outstanding_cap: usize,
}

impl Telemetry {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            transport_rtt: SlidingWindow::new(config.max_samples),
            probe_rtt: SlidingWindow::new(config.max_samples),
            frame_delay: SlidingWindow::new(config.max_samples),
            bitrate: BitrateTracker::new(config.bitrate_window),
            last_bitrate: None,
            network: None,
            rtt_stats_window: config.rtt_stats_window,
            frame_delay_window: config.frame_delay_window,
            loss_outstanding_cap: config.loss_outstanding_cap,
        }
    }

    pub fn record_high_res(&mut self, samples: HighResSamples) {
        for sample in samples.rtt {
            self.transport_rtt.push(sample);
        }
        for sample in samples.frame_delay {
            self.frame_delay.push(sample);
        }
    }

    pub fn record_probe_rtt(&mut self, timestamp: f64, rtt: f64) {
        self.probe_rtt.push(RttSample {
            timestamp,
            rtt,
            jitter: None,
        });
    }

    /// Feed the cumulative outbound byte counter
    pub fn record_outbound(&mut self, bytes_sent: u64, timestamp_ms: f64) -> Option<BitrateReading> {
        let reading = self.bitrate.observe(bytes_sent, timestamp_ms)?;
        self.last_bitrate = Some(reading);
        Some(reading)
    }

    pub fn record_network(&mut self, state: Option<NetworkState>) {
        if state.is_some() {
            self.network = state;
        }
    }

    pub fn transport_rtt_samples(&self) -> usize {
        self.transport_rtt.len()
    }

    pub fn probe_rtt_samples(&self) -> usize {
        self.probe_rtt.len()
    }

    pub fn frame_delay_samples(&self) -> usize {
        self.frame_delay.len()
    }

    /// Recompute the externally visible state from the recent windows
    pub fn snapshot(&self, prober: &Prober) -> QualitySnapshot {
        let rtt = RttStats::from_values(&recent_rtts(&self.transport_rtt, self.rtt_stats_window));
        let probe_rtt = RttStats::from_values(&recent_rtts(&self.probe_rtt, self.rtt_stats_window));
        let delays: Vec<f64> = self
            .frame_delay
            .recent(self.frame_delay_window)
            .map(|s| s.delay)
            .collect();
        let frame_delay = FrameDelayStats::from_values(&delays);

        // Replies are counted over the same recent slice as the RTT stats
        let loss = packet_loss_percent(
            prober.outstanding(),
            probe_rtt.samples,
            self.loss_outstanding_cap,
        );

        let basis = if rtt.samples > 0 { rtt } else { probe_rtt };
        let score = overall_score(basis.average, basis.std_dev, loss);

        QualitySnapshot {
            rtt,
            probe_rtt,
            frame_delay,
            packet_loss_percent: loss,
            probes_outstanding: prober.outstanding(),
            probes_lost: prober.lost(),
            rtt_samples: self.transport_rtt.len(),
            instant_kbps: self.last_bitrate.map(|b| b.instant_kbps),
            average_kbps: self.last_bitrate.map(|b| b.average_kbps),
            network: self.network,
            rtt_quality: classify_rtt(basis.average),
            jitter_quality: classify_jitter(basis.std_dev),
            score,
            overall: classify_overall(score),
        }
    }

    pub fn reset(&mut self) {
        self.transport_rtt.clear();
        self.probe_rtt.clear();
        self.frame_delay.clear();
        self.bitrate.reset();
        self.last_bitrate = None;
        self.network = None;
    }
}

fn recent_rtts(window: &SlidingWindow<RttSample>, n: usize) -> Vec<f64> {
    window.recent(n).map(|s| s.rtt).collect()
}
