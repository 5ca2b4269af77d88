//! Duet Signal Server
//!
//! Pairs two clients into a room and relays their call setup messages.
//! Clients connect via WebSocket and exchange JSON frames.
//!
//! # Protocol
//!
//! 1. First client joins a room and receives `room_created`
//! 2. Second client joins and receives `room_joined`, then sends `start_call`
//! 3. Server relays `start_call`, `offer`, `answer` and `ice_candidate`
//!    verbatim to the other member only
//! 4. A third client receives `full_room`
//! 5. When a member leaves, the survivor receives `peer_left` and the room
//!    accepts a new partner

pub mod messages;
pub mod registry;
pub mod room;
pub mod server;

pub use messages::{
    CallRef, CandidatePayload, Envelope, ErrorCode, RoomRef, SdpPayload, SignalMessage,
    RELAYED_EVENTS,
};
pub use registry::{Departure, JoinOutcome, RegistryStats, RelayTarget, RoomRegistry};
pub use room::{ConnId, Room, RoomError, RoomState};
pub use server::{ServerStats, SignalServer};
