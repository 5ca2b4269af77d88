//! Concurrent room registry
//!
//! Owns every [`Room`] and the connection to room index. All join
//! transitions for a key happen under that key's map entry, so two
//! simultaneous joins of an empty room resolve to one creator and one
//! joiner.

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::room::{ConnId, Room, RoomError, RoomState};

/// Result of a join request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Room was empty; the caller is the initiator
    Created,
    /// Room had one member; the caller is the responder
    Joined,
    /// Room already has two members; nothing changed
    Full,
    /// The caller is already a member of the named room
    AlreadyInRoom(String),
}

/// Where a relayed message from a member should go
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayTarget {
    Peer(ConnId),
    /// Sender is alone in the room
    NoPeer,
    /// Sender is not a member of the named room
    NotMember,
}

/// A connection leaving its room
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Departure {
    pub room_id: String,
    /// Member left behind, to be told its peer is gone
    pub survivor: Option<ConnId>,
    /// Room generation after the departure
    pub generation: u64,
}

/// Counts reported by the health endpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub rooms: usize,
    pub open_rooms: usize,
    pub full_rooms: usize,
    pub members: usize,
}

#[derive(Default)]
pub struct RoomRegistry {
    /// Active rooms by key
    rooms: DashMap<String, Room>,
    /// Connection to room key
    members: DashMap<ConnId, String>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `key`, creating the room if needed
    pub fn join(&self, conn: ConnId, key: &str) -> JoinOutcome {
        if let Some(current) = self.members.get(&conn) {
            return JoinOutcome::AlreadyInRoom(current.value().clone());
        }

        let mut room = self
            .rooms
            .entry(key.to_string())
            .or_insert_with(|| Room::new(key));

        match room.add_member(conn) {
            Ok(count) => {
                self.members.insert(conn, key.to_string());
                debug!("{} entered room {} ({} members)", conn, key, count);
                if count == 1 {
                    JoinOutcome::Created
                } else {
                    JoinOutcome::Joined
                }
            }
            Err(RoomError::RoomFull) => JoinOutcome::Full,
            Err(RoomError::AlreadyMember) => JoinOutcome::AlreadyInRoom(key.to_string()),
        }
    }

    /// Resolve the recipient for a message `conn` sends to room `key`
    pub fn relay_target(&self, conn: ConnId, key: &str) -> RelayTarget {
        let Some(room) = self.rooms.get(key) else {
            return RelayTarget::NotMember;
        };

        if !room.is_member(conn) {
            return RelayTarget::NotMember;
        }

        match room.peer_of(conn) {
            Some(peer) => RelayTarget::Peer(peer),
            None => RelayTarget::NoPeer,
        }
    }

    /// Remove `conn` from its room. Empty rooms are deleted; a full room
    /// drops back to open with the survivor as its only member.
    pub fn leave(&self, conn: ConnId) -> Option<Departure> {
        let (_, key) = self.members.remove(&conn)?;

        let departure = {
            let mut room = self.rooms.get_mut(&key)?;
            room.remove_member(conn);
            Departure {
                room_id: key.clone(),
                survivor: room.members().first().copied(),
                generation: room.generation(),
            }
        };

        if let Some((_, room)) = self.rooms.remove_if(&key, |_, room| room.is_empty()) {
            debug!("Room {} removed after {}s (empty)", key, room.age_secs());
        }

        Some(departure)
    }

    /// Room `conn` is currently a member of
    pub fn room_of(&self, conn: ConnId) -> Option<String> {
        self.members.get(&conn).map(|key| key.value().clone())
    }

    pub fn room_state(&self, key: &str) -> RoomState {
        self.rooms
            .get(key)
            .map(|room| room.state())
            .unwrap_or(RoomState::Empty)
    }

    pub fn members_of(&self, key: &str) -> Vec<ConnId> {
        self.rooms
            .get(key)
            .map(|room| room.members().to_vec())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            members: self.members.len(),
            ..RegistryStats::default()
        };
        for room in self.rooms.iter() {
            stats.rooms += 1;
            match room.state() {
                RoomState::Open => stats.open_rooms += 1,
                RoomState::Full => stats.full_rooms += 1,
                RoomState::Empty => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_create_join_full() {
        let registry = RoomRegistry::new();

        assert_eq!(registry.join(ConnId(1), "R"), JoinOutcome::Created);
        assert_eq!(registry.join(ConnId(2), "R"), JoinOutcome::Joined);
        assert_eq!(registry.join(ConnId(3), "R"), JoinOutcome::Full);

        // Rejection leaves membership unchanged
        assert_eq!(registry.members_of("R"), vec![ConnId(1), ConnId(2)]);
        assert_eq!(registry.room_state("R"), RoomState::Full);
        assert_eq!(registry.room_of(ConnId(3)), None);
    }

    #[test]
    fn test_join_while_in_room() {
        let registry = RoomRegistry::new();
        registry.join(ConnId(1), "R");

        assert_eq!(
            registry.join(ConnId(1), "other"),
            JoinOutcome::AlreadyInRoom("R".into())
        );
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn test_concurrent_joins_yield_one_creator() {
        for _ in 0..50 {
            let registry = Arc::new(RoomRegistry::new());
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (1..=2)
                .map(|id| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        registry.join(ConnId(id), "race")
                    })
                })
                .collect();

            let mut outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            outcomes.sort_by_key(|o| matches!(o, JoinOutcome::Joined));
            assert_eq!(outcomes, vec![JoinOutcome::Created, JoinOutcome::Joined]);
        }
    }

    #[test]
    fn test_relay_target() {
        let registry = RoomRegistry::new();
        registry.join(ConnId(1), "R");
        assert_eq!(registry.relay_target(ConnId(1), "R"), RelayTarget::NoPeer);

        registry.join(ConnId(2), "R");
        assert_eq!(registry.relay_target(ConnId(1), "R"), RelayTarget::Peer(ConnId(2)));
        assert_eq!(registry.relay_target(ConnId(2), "R"), RelayTarget::Peer(ConnId(1)));

        // Outsiders and unknown rooms are rejected
        assert_eq!(registry.relay_target(ConnId(3), "R"), RelayTarget::NotMember);
        assert_eq!(registry.relay_target(ConnId(1), "nope"), RelayTarget::NotMember);
    }

    #[test]
    fn test_leave_demotes_full_room() {
        let registry = RoomRegistry::new();
        registry.join(ConnId(1), "R");
        registry.join(ConnId(2), "R");

        let departure = registry.leave(ConnId(1)).unwrap();
        assert_eq!(departure.room_id, "R");
        assert_eq!(departure.survivor, Some(ConnId(2)));
        assert_eq!(departure.generation, 1);
        assert_eq!(registry.room_state("R"), RoomState::Open);

        // The departed member's stale messages are refused
        assert_eq!(registry.relay_target(ConnId(1), "R"), RelayTarget::NotMember);

        // The room accepts a new partner
        assert_eq!(registry.join(ConnId(3), "R"), JoinOutcome::Joined);
    }

    #[test]
    fn test_last_member_removes_room() {
        let registry = RoomRegistry::new();
        registry.join(ConnId(1), "R");

        let departure = registry.leave(ConnId(1)).unwrap();
        assert_eq!(departure.survivor, None);
        assert_eq!(registry.room_count(), 0);
        assert!(registry.leave(ConnId(1)).is_none());

        // A later joiner starts over as creator
        assert_eq!(registry.join(ConnId(2), "R"), JoinOutcome::Created);
    }

    #[test]
    fn test_stats() {
        let registry = RoomRegistry::new();
        registry.join(ConnId(1), "a");
        registry.join(ConnId(2), "a");
        registry.join(ConnId(3), "b");

        assert_eq!(
            registry.stats(),
            RegistryStats {
                rooms: 2,
                open_rooms: 1,
                full_rooms: 1,
                members: 3,
            }
        );
    }
}
