//! Configuration system for Duet
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/dev.duet.duet/config.toml
//! - Linux: ~/.config/duet/config.toml
//! - Windows: %APPDATA%/duet/duet/config/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::TelemetryError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signal server settings
    pub signal: SignalConfig,
    /// Call client settings
    pub client: ClientConfig,
    /// Telemetry cadences and window sizes
    pub telemetry: TelemetryConfig,
}

/// Signal server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Signal server port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Members per room (two-party rooms only)
    pub room_capacity: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            room_capacity: crate::ROOM_CAPACITY,
        }
    }
}

impl SignalConfig {
    /// Reject room sizes other than two
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.room_capacity != crate::ROOM_CAPACITY {
            return Err(TelemetryError::RoomCapacity {
                expected: crate::ROOM_CAPACITY,
                actual: self.room_capacity,
            });
        }
        Ok(())
    }
}

/// Call client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Signal server URL
    pub signal_url: String,
    /// STUN/TURN server URLs handed to the transport
    pub ice_servers: Vec<String>,
    /// Relay only UDP/IPv4 candidates
    pub filter_candidates: bool,
    /// Request an audio track alongside video
    pub enable_audio: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signal_url: "ws://127.0.0.1:3000".into(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
                "stun:stun2.l.google.com:19302".into(),
                "stun:stun3.l.google.com:19302".into(),
                "stun:stun4.l.google.com:19302".into(),
            ],
            filter_candidates: true,
            enable_audio: false,
        }
    }
}

/// Telemetry cadences (milliseconds) and window sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Side-channel probe cadence
    pub probe_interval_ms: u64,
    /// Time after which an unanswered probe counts as lost
    pub probe_timeout_ms: u64,
    /// Transport RTT and frame-delay extraction cadence
    pub high_res_interval_ms: u64,
    /// Outbound bitrate derivation cadence
    pub bitrate_interval_ms: u64,
    /// Candidate-pair network state cadence
    pub basic_interval_ms: u64,
    /// Verbose report dump cadence
    pub debug_interval_ms: u64,
    /// Codec and encoder analysis cadence
    pub codec_interval_ms: u64,
    /// Capacity of the RTT and frame-delay windows
    pub max_samples: usize,
    /// Readings in the bitrate moving average
    pub bitrate_window: usize,
    /// Recent RTT samples used for statistics
    pub rtt_stats_window: usize,
    /// Recent frame-delay samples used for statistics
    pub frame_delay_window: usize,
    /// Cap on outstanding probes in the loss denominator
    pub loss_outstanding_cap: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 500,
            probe_timeout_ms: 1000,
            high_res_interval_ms: 500,
            bitrate_interval_ms: 1000,
            basic_interval_ms: 1000,
            debug_interval_ms: 2000,
            codec_interval_ms: 3000,
            max_samples: crate::MAX_SAMPLES,
            bitrate_window: crate::BITRATE_WINDOW,
            rtt_stats_window: crate::RTT_STATS_WINDOW,
            frame_delay_window: crate::FRAME_DELAY_STATS_WINDOW,
            loss_outstanding_cap: crate::LOSS_OUTSTANDING_CAP,
        }
    }
}

impl TelemetryConfig {
    /// Check that every cadence and capacity is non-zero
    pub fn validate(&self) -> Result<(), TelemetryError> {
        let intervals = [
            ("probe_interval_ms", self.probe_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("high_res_interval_ms", self.high_res_interval_ms),
            ("bitrate_interval_ms", self.bitrate_interval_ms),
            ("basic_interval_ms", self.basic_interval_ms),
            ("debug_interval_ms", self.debug_interval_ms),
            ("codec_interval_ms", self.codec_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(TelemetryError::ZeroInterval { name });
        }

        let capacities = [
            ("max_samples", self.max_samples),
            ("bitrate_window", self.bitrate_window),
            ("rtt_stats_window", self.rtt_stats_window),
            ("frame_delay_window", self.frame_delay_window),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, n)| *n == 0) {
            return Err(TelemetryError::ZeroCapacity { name });
        }

        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "duet", "duet")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), TelemetryError> {
        self.signal.validate()?;
        self.telemetry.validate()
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
