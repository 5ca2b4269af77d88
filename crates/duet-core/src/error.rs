//! Error types for Duet telemetry

use thiserror::Error;

/// Errors raised while validating telemetry settings
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("interval `{name}` must be greater than zero")]
    ZeroInterval { name: &'static str },

    #[error("capacity `{name}` must be greater than zero")]
    ZeroCapacity { name: &'static str },

    #[error("room capacity must be exactly {expected} (got {actual})")]
    RoomCapacity { expected: usize, actual: usize },
}
