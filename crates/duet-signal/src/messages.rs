//! Signal protocol messages
//!
//! Every frame on the signaling WebSocket is one JSON object of the form
//! `{"event": "<name>", "data": <payload>}`. Payload fields are camelCase.
//!
//! The server reads only the [`Envelope`] of call setup frames and forwards
//! the original text, so peers may carry fields this crate does not model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events the server forwards to the other room member untouched
pub const RELAYED_EVENTS: [&str; 4] = ["start_call", "offer", "answer", "ice_candidate"];

/// Messages sent over the signaling WebSocket
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Client asks to enter a room
    Join(RoomRef),

    /// First member of the room; the receiver will make the offer
    RoomCreated(RoomRef),

    /// Second member of the room; the receiver will answer
    RoomJoined(RoomRef),

    /// Room already has two members
    FullRoom(RoomRef),

    /// Joiner is ready; relayed to the creator
    StartCall(CallRef),

    /// Session description from the initiator
    Offer(SdpPayload),

    /// Session description from the responder
    Answer(SdpPayload),

    /// Trickled transport candidate
    IceCandidate(CandidatePayload),

    /// Client leaves its room without disconnecting
    Leave(RoomRef),

    /// The other member left or disconnected
    PeerLeft(RoomRef),

    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Payload naming a room
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: String,
}

/// `start_call` payload; the room may be implied by the sender's membership
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

/// Offer or answer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpPayload {
    /// `offer` or `answer`
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
    pub room_id: String,
}

/// Transport candidate
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub room_id: String,
    /// Media line index the candidate belongs to
    #[serde(default)]
    pub label: Option<u16>,
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

/// Error codes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Relay or leave for a room the sender is not a member of
    NotInRoom,

    /// Join while already in a room
    AlreadyInRoom,

    /// Frame is not a valid signal message
    InvalidMessage,

    /// Valid message that clients may not send
    UnexpectedMessage,

    /// Internal server error
    InternalError,
}

/// Outer shape of any frame, with the payload left unparsed
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn is_relayed(&self) -> bool {
        RELAYED_EVENTS.contains(&self.event.as_str())
    }

    /// `roomId` of the payload when it is a string
    pub fn room_id(&self) -> Option<&str> {
        self.data.get("roomId").and_then(Value::as_str)
    }
}

impl RoomRef {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
        }
    }
}

impl SignalMessage {
    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn join(room_id: impl Into<String>) -> Self {
        Self::Join(RoomRef::new(room_id))
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name of the event
    pub fn event(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::RoomCreated(_) => "room_created",
            Self::RoomJoined(_) => "room_joined",
            Self::FullRoom(_) => "full_room",
            Self::StartCall(_) => "start_call",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice_candidate",
            Self::Leave(_) => "leave",
            Self::PeerLeft(_) => "peer_left",
            Self::Error { .. } => "error",
        }
    }

    /// Room named in the payload, if any
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::Join(r)
            | Self::RoomCreated(r)
            | Self::RoomJoined(r)
            | Self::FullRoom(r)
            | Self::Leave(r)
            | Self::PeerLeft(r) => Some(&r.room_id),
            Self::StartCall(c) => c.room_id.as_deref(),
            Self::Offer(p) | Self::Answer(p) => Some(&p.room_id),
            Self::IceCandidate(c) => Some(&c.room_id),
            Self::Error { .. } => None,
        }
    }

    /// Whether the relay forwards this message to the other room member
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            Self::StartCall(_) | Self::Offer(_) | Self::Answer(_) | Self::IceCandidate(_)
        )
    }
}
