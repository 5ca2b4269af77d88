//! Peer transport abstraction
//!
//! The session drives the peer connection only through [`PeerTransport`],
//! and learns about asynchronous transport activity from the
//! [`TransportEvent`] stream handed to [`TransportFactory::create`]. The
//! production implementation lives in [`crate::rtc`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use duet_core::StatsReport;
use duet_signal::{CandidatePayload, SdpPayload};

use crate::error::TransportError;
use crate::media::LocalMedia;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

/// An offer or answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Wire payload for `room_id`
    pub fn to_payload(&self, room_id: &str) -> SdpPayload {
        SdpPayload {
            sdp_type: self.sdp_type.as_str().to_string(),
            sdp: self.sdp.clone(),
            room_id: room_id.to_string(),
        }
    }

    /// Parse a relayed payload, checking its declared type
    pub fn from_payload(payload: &SdpPayload, expected: SdpType) -> Result<Self, TransportError> {
        if payload.sdp_type != expected.as_str() {
            return Err(TransportError::InvalidDescription(format!(
                "expected {}, got {}",
                expected.as_str(),
                payload.sdp_type
            )));
        }
        Ok(Self {
            sdp_type: expected,
            sdp: payload.sdp.clone(),
        })
    }
}

/// A trickled transport candidate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn to_payload(&self, room_id: &str) -> CandidatePayload {
        CandidatePayload {
            room_id: room_id.to_string(),
            label: self.sdp_mline_index,
            candidate: self.candidate.clone(),
            sdp_mid: self.sdp_mid.clone(),
        }
    }

    pub fn from_payload(payload: &CandidatePayload) -> Self {
        Self {
            candidate: payload.candidate.clone(),
            sdp_mid: payload.sdp_mid.clone(),
            sdp_mline_index: payload.label,
        }
    }
}

/// Aggregate peer connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Asynchronous transport activity
#[derive(Clone)]
pub enum TransportEvent {
    /// Locally gathered candidate, to be relayed to the peer
    LocalCandidate(IceCandidate),
    /// Channel created by the remote side
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen { label: String },
    ChannelMessage { label: String, text: String },
    ChannelClosed { label: String },
    /// Remote media track arrived
    Track { kind: MediaKind },
    StateChanged(ConnectionState),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            TransportEvent::DataChannel(dc) => {
                f.debug_tuple("DataChannel").field(&dc.label()).finish()
            }
            TransportEvent::ChannelOpen { label } => {
                f.debug_struct("ChannelOpen").field("label", label).finish()
            }
            TransportEvent::ChannelMessage { label, text } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("text", text)
                .finish(),
            TransportEvent::ChannelClosed { label } => {
                f.debug_struct("ChannelClosed").field("label", label).finish()
            }
            TransportEvent::Track { kind } => f.debug_struct("Track").field("kind", kind).finish(),
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// A reliable ordered message channel between the peers
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> ChannelState;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// One peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Attach local tracks before negotiation
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), TransportError>;

    /// Open a reliable ordered channel; open, message and close activity
    /// is reported as [`TransportEvent`]s
    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Current statistics snapshot
    async fn get_stats(&self) -> Result<Vec<StatsReport>, TransportError>;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds one transport per call
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
