//! Room management for signal server

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

/// Server-assigned identity of one WebSocket connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Membership state of a room
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Empty,
    Open,
    Full,
}

/// Room errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room is full")]
    RoomFull,
    #[error("connection is already a member")]
    AlreadyMember,
}

/// A two-party rendezvous point
pub struct Room {
    /// Caller-chosen key for this room
    pub key: String,

    /// Members in join order; the first is the offer initiator
    members: Vec<ConnId>,

    /// Bumped every time a pairing is broken
    generation: u64,

    created_at: Instant,
}

impl Room {
    /// Create a new room
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            members: Vec::with_capacity(duet_core::ROOM_CAPACITY),
            generation: 0,
            created_at: Instant::now(),
        }
    }

    pub fn state(&self) -> RoomState {
        match self.members.len() {
            0 => RoomState::Empty,
            n if n < duet_core::ROOM_CAPACITY => RoomState::Open,
            _ => RoomState::Full,
        }
    }

    /// Add a member, returning the membership count afterwards
    pub fn add_member(&mut self, conn: ConnId) -> Result<usize, RoomError> {
        if self.members.contains(&conn) {
            return Err(RoomError::AlreadyMember);
        }
        if self.members.len() >= duet_core::ROOM_CAPACITY {
            return Err(RoomError::RoomFull);
        }

        self.members.push(conn);
        Ok(self.members.len())
    }

    /// Remove a member. Breaking a full pairing starts a new generation.
    pub fn remove_member(&mut self, conn: ConnId) -> bool {
        let was_full = self.state() == RoomState::Full;
        let before = self.members.len();
        self.members.retain(|m| *m != conn);

        let removed = self.members.len() != before;
        if removed && was_full {
            self.generation += 1;
        }
        removed
    }

    /// The other member, if `conn` is a member and the room has one
    pub fn peer_of(&self, conn: ConnId) -> Option<ConnId> {
        if !self.is_member(conn) {
            return None;
        }
        self.members.iter().copied().find(|m| *m != conn)
    }

    pub fn is_member(&self, conn: ConnId) -> bool {
        self.members.contains(&conn)
    }

    pub fn members(&self) -> &[ConnId] {
        &self.members
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Seconds since the room was created
    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_creation() {
        let room = Room::new("lobby");
        assert_eq!(room.key, "lobby");
        assert!(room.is_empty());
        assert_eq!(room.state(), RoomState::Empty);
    }

    #[test]
    fn test_state_transitions() {
        let mut room = Room::new("lobby");

        assert_eq!(room.add_member(ConnId(1)), Ok(1));
        assert_eq!(room.state(), RoomState::Open);

        assert_eq!(room.add_member(ConnId(2)), Ok(2));
        assert_eq!(room.state(), RoomState::Full);

        assert_eq!(room.add_member(ConnId(3)), Err(RoomError::RoomFull));
        assert_eq!(room.members(), &[ConnId(1), ConnId(2)]);
    }

    #[test]
    fn test_duplicate_member() {
        let mut room = Room::new("lobby");
        room.add_member(ConnId(1)).unwrap();
        assert_eq!(room.add_member(ConnId(1)), Err(RoomError::AlreadyMember));
        assert_eq!(room.member_count(), 1);
    }

    #[test]
    fn test_peer_of() {
        let mut room = Room::new("lobby");
        room.add_member(ConnId(1)).unwrap();
        assert_eq!(room.peer_of(ConnId(1)), None);

        room.add_member(ConnId(2)).unwrap();
        assert_eq!(room.peer_of(ConnId(1)), Some(ConnId(2)));
        assert_eq!(room.peer_of(ConnId(2)), Some(ConnId(1)));
        assert_eq!(room.peer_of(ConnId(9)), None);
    }

    #[test]
    fn test_departure_demotes_and_bumps_generation() {
        let mut room = Room::new("lobby");
        room.add_member(ConnId(1)).unwrap();
        room.add_member(ConnId(2)).unwrap();

        assert!(room.remove_member(ConnId(1)));
        assert_eq!(room.state(), RoomState::Open);
        assert_eq!(room.generation(), 1);
        assert_eq!(room.members(), &[ConnId(2)]);

        // Leaving an open room does not start a new generation
        assert!(room.remove_member(ConnId(2)));
        assert_eq!(room.generation(), 1);
        assert!(!room.remove_member(ConnId(2)));
        assert_eq!(room.state(), RoomState::Empty);
    }
}
