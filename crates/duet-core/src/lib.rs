//! Duet Core - Shared configuration, sample windows, and quality math
//!
//! This crate contains the pieces of Duet that do not touch the network:
//! bounded sample windows, statistics and quality classification, typed
//! extraction of transport statistics reports, and the configuration layer.

pub mod config;
pub mod error;
pub mod quality;
pub mod sdp;
pub mod stats;
pub mod window;

pub use config::{ClientConfig, Config, ConfigError, SignalConfig, TelemetryConfig};
pub use error::TelemetryError;
pub use quality::{
    classify_jitter, classify_overall, classify_rtt, overall_score, packet_loss_percent,
    FrameDelayStats, QualityLevel, QualitySnapshot, RttStats,
};
pub use sdp::{analyze_sdp, SdpAnalysis};
pub use stats::{BitrateReading, BitrateTracker, NetworkState, StatsReport};
pub use window::{BitrateSample, FrameDelaySample, RttSample, SlidingWindow};

/// Capacity of the RTT and frame-delay sample windows
pub const MAX_SAMPLES: usize = 1000;

/// Number of instantaneous bitrate readings in the moving average
pub const BITRATE_WINDOW: usize = 10;

/// Number of most recent RTT samples used for statistics
pub const RTT_STATS_WINDOW: usize = 100;

/// Number of most recent frame-delay samples used for statistics
pub const FRAME_DELAY_STATS_WINDOW: usize = 50;

/// Upper bound on outstanding probes counted in the loss denominator
pub const LOSS_OUTSTANDING_CAP: usize = 5;

/// Members allowed in one room
pub const ROOM_CAPACITY: usize = 2;

/// Label of the side channel carrying RTT probes
pub const PING_CHANNEL_LABEL: &str = "ping";
