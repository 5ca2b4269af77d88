//! Error types for the call client

use thiserror::Error;

use duet_core::TelemetryError;

/// Failures reported by a peer transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer connection error: {0}")]
    Rtc(String),

    #[error("data channel '{0}' is not open")]
    ChannelNotOpen(String),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("transport closed")]
    Closed,
}

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        TransportError::Rtc(e.to_string())
    }
}

/// Errors that end or interrupt a call session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection to signal server failed: {0}")]
    Connect(String),

    #[error("signaling timed out")]
    Timeout,

    #[error("signaling channel closed")]
    SignalingClosed,

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("room {0} is full")]
    RoomFull(String),

    #[error("media acquisition failed: {0}")]
    Media(String),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] TelemetryError),
}
