//! Connection quality statistics and classification

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stats::NetworkState;

/// Discrete quality label
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityLevel::Excellent => write!(f, "excellent"),
            QualityLevel::Good => write!(f, "good"),
            QualityLevel::Fair => write!(f, "fair"),
            QualityLevel::Poor => write!(f, "poor"),
        }
    }
}

/// Summary statistics over a slice of RTT values (milliseconds)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RttStats {
    pub current: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub samples: usize,
}

impl RttStats {
    /// Compute statistics over `values`, oldest first. Empty input gives all zeros.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let n = values.len() as f64;
        let average = values.iter().sum::<f64>() / n;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let variance = values.iter().map(|v| (v - average).powi(2)).sum::<f64>() / n;

        Self {
            current: values[values.len() - 1],
            average,
            min,
            max,
            std_dev: variance.sqrt(),
            samples: values.len(),
        }
    }
}

/// Capture-to-render delay summary (milliseconds)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameDelayStats {
    pub current: f64,
    pub average: f64,
}

impl FrameDelayStats {
    pub fn from_values(values: &[f64]) -> Self {
        match values.last() {
            Some(&current) => Self {
                current,
                average: values.iter().sum::<f64>() / values.len() as f64,
            },
            None => Self::default(),
        }
    }
}

pub fn classify_rtt(rtt_ms: f64) -> QualityLevel {
    if rtt_ms < 50.0 {
        QualityLevel::Excellent
    } else if rtt_ms < 100.0 {
        QualityLevel::Good
    } else if rtt_ms < 200.0 {
        QualityLevel::Fair
    } else {
        QualityLevel::Poor
    }
}

pub fn classify_jitter(jitter_ms: f64) -> QualityLevel {
    if jitter_ms < 10.0 {
        QualityLevel::Excellent
    } else if jitter_ms < 20.0 {
        QualityLevel::Good
    } else if jitter_ms < 50.0 {
        QualityLevel::Fair
    } else {
        QualityLevel::Poor
    }
}

/// Composite 0-6 score: two points each for RTT, jitter, and loss
pub fn overall_score(rtt_ms: f64, jitter_ms: f64, loss_percent: f64) -> u8 {
    let rtt = if rtt_ms < 100.0 {
        2
    } else if rtt_ms < 200.0 {
        1
    } else {
        0
    };

    let jitter = if jitter_ms < 20.0 {
        2
    } else if jitter_ms < 50.0 {
        1
    } else {
        0
    };

    let loss = if loss_percent < 1.0 {
        2
    } else if loss_percent < 5.0 {
        1
    } else {
        0
    };

    rtt + jitter + loss
}

pub fn classify_overall(score: u8) -> QualityLevel {
    if score >= 5 {
        QualityLevel::Excellent
    } else if score >= 3 {
        QualityLevel::Good
    } else if score >= 1 {
        QualityLevel::Fair
    } else {
        QualityLevel::Poor
    }
}

/// Loss estimate from side-channel probes.
///
/// `outstanding / (replied + min(outstanding, cap)) * 100`. This is an
/// approximation, not a transport-verified loss rate.
pub fn packet_loss_percent(outstanding: usize, replied: usize, cap: usize) -> f64 {
    let total = replied + outstanding.min(cap);
    if total == 0 {
        return 0.0;
    }
    outstanding as f64 / total as f64 * 100.0
}

/// Externally observable telemetry state, recomputed on demand
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualitySnapshot {
    /// Transport-reported RTT over the recent window
    pub rtt: RttStats,
    /// Side-channel probe RTT over the recent window
    pub probe_rtt: RttStats,
    pub frame_delay: FrameDelayStats,
    pub packet_loss_percent: f64,
    pub probes_outstanding: usize,
    pub probes_lost: u64,
    /// Samples held in the transport RTT window
    pub rtt_samples: usize,
    pub instant_kbps: Option<f64>,
    pub average_kbps: Option<f64>,
    pub network: Option<NetworkState>,
    pub rtt_quality: QualityLevel,
    pub jitter_quality: QualityLevel,
    pub score: u8,
    pub overall: QualityLevel,
}

impl Default for QualitySnapshot {
    fn default() -> Self {
        Self {
            rtt: RttStats::default(),
            probe_rtt: RttStats::default(),
            frame_delay: FrameDelayStats::default(),
            packet_loss_percent: 0.0,
            probes_outstanding: 0,
            probes_lost: 0,
            rtt_samples: 0,
            instant_kbps: None,
            average_kbps: None,
            network: None,
            rtt_quality: QualityLevel::Excellent,
            jitter_quality: QualityLevel::Excellent,
            score: 6,
            overall: QualityLevel::Excellent,
        }
    }
}
