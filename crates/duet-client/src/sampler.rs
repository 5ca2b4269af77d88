//! Stats sampling cadences
//!
//! Five independent repeating timers decide when the session queries the
//! transport's statistics and what it extracts. Dropping the [`Sampler`]
//! cancels all of them.

use std::fmt;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use duet_core::TelemetryConfig;

/// What a sampler tick asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleKind {
    /// Transport RTT and frame delay
    HighRes,
    /// Outbound bitrate
    Bitrate,
    /// Candidate-pair network state and encoder counters
    Basic,
    /// Verbose per-report dump
    Debug,
    /// Codec and hardware-encoder analysis
    Codec,
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SampleKind::HighRes => "high-res",
            SampleKind::Bitrate => "bitrate",
            SampleKind::Basic => "basic",
            SampleKind::Debug => "debug",
            SampleKind::Codec => "codec",
        };
        f.write_str(s)
    }
}

pub struct Sampler {
    high_res: Interval,
    bitrate: Interval,
    basic: Interval,
    debug: Interval,
    codec: Interval,
}

impl Sampler {
    /// Start all cadences; each first fires one period from now
    pub fn start(config: &TelemetryConfig) -> Self {
        Self {
            high_res: cadence(config.high_res_interval_ms),
            bitrate: cadence(config.bitrate_interval_ms),
            basic: cadence(config.basic_interval_ms),
            debug: cadence(config.debug_interval_ms),
            codec: cadence(config.codec_interval_ms),
        }
    }

    /// Wait for the next due cadence
    pub async fn next(&mut self) -> SampleKind {
        tokio::select! {
            _ = self.high_res.tick() => SampleKind::HighRes,
            _ = self.bitrate.tick() => SampleKind::Bitrate,
            _ = self.basic.tick() => SampleKind::Basic,
            _ = self.debug.tick() => SampleKind::Debug,
            _ = self.codec.tick() => SampleKind::Codec,
        }
    }
}

/// Repeating timer with a zero period clamped to 1ms
pub(crate) fn cadence(period_ms: u64) -> Interval {
    let period = Duration::from_millis(period_ms.max(1));
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
