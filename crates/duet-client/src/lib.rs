//! Duet call client
//!
//! Joins a room on a Duet signal server, negotiates a peer connection with
//! the other member and measures the connection's quality while the call
//! runs.
//!
//! # Architecture
//!
//! - [`session`]: per-room state machine driving negotiation and telemetry
//! - [`signaling`]: WebSocket link to the signal server
//! - [`transport`]: the peer-connection seam, implemented by [`rtc`]
//! - [`prober`]: round-trip probes over a dedicated data channel
//! - [`sampler`]: statistics cadences
//! - [`telemetry`]: bounded sample windows and quality snapshots

pub mod candidate;
pub mod error;
pub mod media;
pub mod prober;
pub mod rtc;
pub mod sampler;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use candidate::{should_relay_candidate, PendingCandidates};
pub use error::{SessionError, TransportError};
pub use media::{LocalMedia, LocalTrack, MediaConstraints, MediaSource, StaticMediaSource};
pub use prober::{ProbeMessage, Prober, SessionClock};
pub use rtc::RtcTransportFactory;
pub use sampler::{SampleKind, Sampler};
pub use session::{Session, SessionState};
pub use signaling::{connect, SignalLink};
pub use telemetry::Telemetry;
pub use transport::{
    ChannelState, ConnectionState, DataChannel, IceCandidate, MediaKind, PeerTransport, SdpType,
    SessionDescription, TransportEvent, TransportFactory,
};
