//! Room presence table: which connections are currently viewing which board.
//!
//! This is the only shared mutable state in the engine. The table maps a
//! room id to its member set and guarantees, after every mutation:
//!
//! 1. A connection appears at most once per room (idempotent join; a
//!    re-join overwrites the identity, it never duplicates).
//! 2. No room entry exists with an empty member set — a room is created
//!    lazily on first join and deleted the instant it empties.
//! 3. Member snapshots handed to commit callbacks reflect the state after
//!    the mutation that produced them, in per-room mutation order.
//!
//! ## Locking
//!
//! ```text
//! RoomTable
//!   rooms: RwLock<HashMap<RoomId, Arc<Room>>>     (map lock)
//!             │
//!             └── Room { state: RwLock<RoomState> } (room lock)
//! ```
//!
//! Mutations of the same room serialize on that room's lock; unrelated
//! rooms never block each other. Lock order is always map → room, and no
//! critical section performs I/O or awaits.
//!
//! Deleting an emptied room is an atomic compare-and-delete: the room is
//! re-checked for emptiness under the map write lock and flagged `closed`
//! before removal, so a join racing the delete can never insert into a
//! detached room — it observes the flag and retries against a fresh entry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::protocol::{ConnectionId, Member};

/// Presence table errors. There is no fatal class: every failure degrades
/// to a rejected or dropped event for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceError {
    /// The room is at its configured member limit.
    RoomFull { room_id: String, limit: usize },
}

impl std::fmt::Display for PresenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoomFull { room_id, limit } => {
                write!(f, "Room {room_id} is full ({limit} members)")
            }
        }
    }
}

impl std::error::Error for PresenceError {}

struct RoomState {
    /// Insertion-ordered member list, unique by connection id. Rooms are
    /// small (people looking at one board), so linear scans are fine.
    members: Vec<Member>,
    /// Set under the map write lock when the room entry is removed; a join
    /// that raced the removal sees this and retries.
    closed: bool,
}

struct Room {
    state: RwLock<RoomState>,
}

impl Room {
    fn new() -> Self {
        Self {
            state: RwLock::new(RoomState {
                members: Vec::new(),
                closed: false,
            }),
        }
    }
}

/// The room presence table.
pub struct RoomTable {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Hard cap on members per room; joins beyond it are refused.
    member_limit: usize,
}

impl RoomTable {
    /// Create a table with no member limit.
    pub fn new() -> Self {
        Self::with_member_limit(usize::MAX)
    }

    /// Create a table that refuses joins past `limit` members per room.
    pub fn with_member_limit(limit: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            member_limit: limit.max(1),
        }
    }

    /// Look up a room, creating it if absent (double-checked under the
    /// write lock).
    fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }
        let room = Arc::new(Room::new());
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Insert `connection_id` into the room's member set, creating the room
    /// if needed. Re-joining overwrites the identity (last join wins) and
    /// never duplicates the entry.
    ///
    /// `on_commit` runs with the post-mutation member list while the room's
    /// lock is still held, so broadcasts enqueued from it are observed in
    /// mutation order. Returns the same snapshot.
    pub fn join(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        identity: &str,
        on_commit: impl FnOnce(&[Member]),
    ) -> Result<Vec<Member>, PresenceError> {
        loop {
            let room = self.get_or_create(room_id);
            let mut state = room.state.write().unwrap_or_else(|p| p.into_inner());
            if state.closed {
                // Lost the race against delete-if-empty; the entry we hold
                // is detached from the map. Retry against a fresh one.
                continue;
            }

            match state.members.iter().position(|m| m.connection_id == connection_id) {
                Some(idx) => state.members[idx].identity = identity.to_string(),
                None => {
                    if state.members.len() >= self.member_limit {
                        return Err(PresenceError::RoomFull {
                            room_id: room_id.to_string(),
                            limit: self.member_limit,
                        });
                    }
                    state.members.push(Member::new(connection_id, identity));
                }
            }

            let snapshot = state.members.clone();
            on_commit(&snapshot);
            return Ok(snapshot);
        }
    }

    /// Remove `connection_id` from the room's member set. A connection that
    /// was never a member is a no-op, not an error, and `on_commit` is not
    /// invoked for it. An emptied room is deleted.
    ///
    /// Returns the post-mutation member list; empty means the room no
    /// longer exists.
    pub fn leave(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        on_commit: impl FnOnce(&[Member]),
    ) -> Vec<Member> {
        let Some(room) = self.get(room_id) else {
            return Vec::new();
        };

        let (snapshot, now_empty) = {
            let mut state = room.state.write().unwrap_or_else(|p| p.into_inner());
            let before = state.members.len();
            state.members.retain(|m| m.connection_id != connection_id);
            if state.members.len() == before {
                // Not a member; nothing changed, nothing to announce.
                return state.members.clone();
            }
            let snapshot = state.members.clone();
            on_commit(&snapshot);
            (snapshot, state.members.is_empty())
        };

        if now_empty {
            self.remove_if_empty(room_id);
        }
        snapshot
    }

    /// Atomic compare-and-delete: removes the room only if it is still
    /// empty at the moment both locks are held. Returns whether it removed.
    fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        if let Some(room) = rooms.get(room_id) {
            let mut state = room.state.write().unwrap_or_else(|p| p.into_inner());
            if state.members.is_empty() {
                state.closed = true;
                drop(state);
                rooms.remove(room_id);
                log::debug!("Room {room_id} removed (empty)");
                return true;
            }
        }
        false
    }

    /// Leave every room in `room_ids`, invoking `on_room` per affected room
    /// (same semantics as [`leave`](Self::leave)). Returns each affected
    /// room id with its resulting member list.
    pub fn remove_from_all_rooms(
        &self,
        connection_id: ConnectionId,
        room_ids: impl IntoIterator<Item = String>,
        mut on_room: impl FnMut(&str, &[Member]),
    ) -> Vec<(String, Vec<Member>)> {
        room_ids
            .into_iter()
            .map(|room_id| {
                let members = self.leave(&room_id, connection_id, |members| {
                    on_room(&room_id, members)
                });
                (room_id, members)
            })
            .collect()
    }

    /// Evict a room entirely, forcibly detaching any remaining members
    /// (the room-deleted path). `on_commit` runs with the detached member
    /// list while the room's lock is held. Returns the detached members.
    pub fn delete_room(
        &self,
        room_id: &str,
        on_commit: impl FnOnce(&[Member]),
    ) -> Vec<Member> {
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        let Some(room) = rooms.remove(room_id) else {
            return Vec::new();
        };
        let mut state = room.state.write().unwrap_or_else(|p| p.into_inner());
        state.closed = true;
        let evicted = std::mem::take(&mut state.members);
        on_commit(&evicted);
        log::info!("Room {room_id} deleted, {} members detached", evicted.len());
        evicted
    }

    /// Read-only member snapshot. A missing room and an empty room are
    /// indistinguishable, by design.
    pub fn members(&self, room_id: &str) -> Vec<Member> {
        match self.get(room_id) {
            Some(room) => {
                let state = room.state.read().unwrap_or_else(|p| p.into_inner());
                state.members.clone()
            }
            None => Vec::new(),
        }
    }

    pub fn is_member(&self, room_id: &str, connection_id: ConnectionId) -> bool {
        match self.get(room_id) {
            Some(room) => {
                let state = room.state.read().unwrap_or_else(|p| p.into_inner());
                state.members.iter().any(|m| m.connection_id == connection_id)
            }
            None => false,
        }
    }

    pub fn contains_room(&self, room_id: &str) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        rooms.len()
    }

    pub fn room_ids(&self) -> Vec<String> {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        rooms.keys().cloned().collect()
    }
}

impl Default for RoomTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn names(members: &[Member]) -> Vec<&str> {
        members.iter().map(|m| m.identity.as_str()).collect()
    }

    #[test]
    fn test_join_creates_room_lazily() {
        let table = RoomTable::new();
        assert!(!table.contains_room("r1"));

        let conn = Uuid::new_v4();
        let members = table.join("r1", conn, "alice", |_| {}).unwrap();
        assert_eq!(names(&members), ["alice"]);
        assert!(table.contains_room("r1"));
        assert_eq!(table.room_count(), 1);
    }

    #[test]
    fn test_join_is_idempotent() {
        let table = RoomTable::new();
        let conn = Uuid::new_v4();

        table.join("r1", conn, "alice", |_| {}).unwrap();
        let members = table.join("r1", conn, "alice", |_| {}).unwrap();

        assert_eq!(members.len(), 1);
        assert_eq!(members[0].connection_id, conn);
    }

    #[test]
    fn test_rejoin_overwrites_identity() {
        // Last join wins: a re-join with a different identity replaces the
        // entry, it does not duplicate it.
        let table = RoomTable::new();
        let conn = Uuid::new_v4();

        table.join("r1", conn, "alice", |_| {}).unwrap();
        let members = table.join("r1", conn, "alice@corp", |_| {}).unwrap();

        assert_eq!(names(&members), ["alice@corp"]);
    }

    #[test]
    fn test_leave_removes_member() {
        let table = RoomTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        table.join("r1", a, "alice", |_| {}).unwrap();
        table.join("r1", b, "bob", |_| {}).unwrap();

        let members = table.leave("r1", a, |_| {});
        assert_eq!(names(&members), ["bob"]);
        assert!(table.contains_room("r1"));
    }

    #[test]
    fn test_leave_last_member_deletes_room() {
        let table = RoomTable::new();
        let conn = Uuid::new_v4();
        table.join("r1", conn, "alice", |_| {}).unwrap();

        let members = table.leave("r1", conn, |_| {});
        assert!(members.is_empty());
        // Equivalent to "room never existed", no zero-length entry leaks.
        assert!(!table.contains_room("r1"));
        assert_eq!(table.room_count(), 0);
        assert!(table.members("r1").is_empty());
    }

    #[test]
    fn test_leave_non_member_is_noop() {
        let table = RoomTable::new();
        let a = Uuid::new_v4();
        table.join("r1", a, "alice", |_| {}).unwrap();

        let mut called = false;
        let members = table.leave("r1", Uuid::new_v4(), |_| called = true);
        assert!(!called, "no mutation, no commit callback");
        assert_eq!(names(&members), ["alice"]);

        // Leaving a room that never existed is also a no-op.
        assert!(table.leave("nope", a, |_| {}).is_empty());
    }

    #[test]
    fn test_room_can_be_recreated_after_deletion() {
        let table = RoomTable::new();
        let conn = Uuid::new_v4();
        table.join("r1", conn, "alice", |_| {}).unwrap();
        table.leave("r1", conn, |_| {});
        assert!(!table.contains_room("r1"));

        let other = Uuid::new_v4();
        let members = table.join("r1", other, "bob", |_| {}).unwrap();
        assert_eq!(names(&members), ["bob"]);
    }

    #[test]
    fn test_remove_from_all_rooms() {
        let table = RoomTable::new();
        let conn = Uuid::new_v4();
        let other = Uuid::new_v4();
        table.join("a", conn, "alice", |_| {}).unwrap();
        table.join("b", conn, "alice", |_| {}).unwrap();
        table.join("b", other, "bob", |_| {}).unwrap();
        table.join("c", other, "bob", |_| {}).unwrap();

        let mut touched = Vec::new();
        let results = table.remove_from_all_rooms(
            conn,
            ["a".to_string(), "b".to_string()],
            |room_id, _| touched.push(room_id.to_string()),
        );

        assert_eq!(touched, ["a", "b"]);
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_empty()); // "a" emptied and was deleted
        assert_eq!(names(&results[1].1), ["bob"]);
        assert!(!table.contains_room("a"));
        assert!(table.contains_room("b"));
        assert!(table.is_member("c", other)); // untouched room
    }

    #[test]
    fn test_delete_room_detaches_members() {
        let table = RoomTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        table.join("r1", a, "alice", |_| {}).unwrap();
        table.join("r1", b, "bob", |_| {}).unwrap();

        let mut seen = 0;
        let evicted = table.delete_room("r1", |members| seen = members.len());
        assert_eq!(seen, 2);
        assert_eq!(evicted.len(), 2);
        assert!(!table.contains_room("r1"));

        // Deleting a missing room is a no-op.
        assert!(table.delete_room("r1", |_| {}).is_empty());
    }

    #[test]
    fn test_member_limit() {
        let table = RoomTable::with_member_limit(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        table.join("r1", a, "alice", |_| {}).unwrap();
        table.join("r1", b, "bob", |_| {}).unwrap();

        let err = table.join("r1", Uuid::new_v4(), "carol", |_| {}).unwrap_err();
        assert!(matches!(err, PresenceError::RoomFull { limit: 2, .. }));

        // An existing member re-joining is not refused by the limit.
        assert!(table.join("r1", a, "alice", |_| {}).is_ok());
    }

    #[test]
    fn test_commit_callback_sees_post_mutation_state() {
        let table = RoomTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut observed = Vec::new();
        table.join("r1", a, "alice", |m| observed.push(m.len())).unwrap();
        table.join("r1", b, "bob", |m| observed.push(m.len())).unwrap();
        table.leave("r1", a, |m| observed.push(m.len()));

        assert_eq!(observed, [1, 2, 1]);
    }

    #[test]
    fn test_rooms_are_isolated() {
        let table = Arc::new(RoomTable::new());

        // Many threads hammering distinct rooms must interleave freely and
        // leave each room's state exact.
        let mut handles = Vec::new();
        for i in 0..8 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                let room = format!("room-{i}");
                for _ in 0..100 {
                    let conn = Uuid::new_v4();
                    table.join(&room, conn, "user", |_| {}).unwrap();
                    table.leave(&room, conn, |_| {});
                }
                let keeper = Uuid::new_v4();
                table.join(&room, keeper, "keeper", |_| {}).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(table.room_count(), 8);
        for i in 0..8 {
            assert_eq!(table.members(&format!("room-{i}")).len(), 1);
        }
    }

    #[test]
    fn test_concurrent_join_and_empty_delete_never_detaches() {
        // A join racing the delete-of-emptied-room path must either land in
        // the old entry (keeping it alive) or a fresh one — never vanish.
        let table = Arc::new(RoomTable::new());

        for _ in 0..50 {
            let leaver = Uuid::new_v4();
            table.join("contested", leaver, "leaver", |_| {}).unwrap();

            let t1 = {
                let table = table.clone();
                std::thread::spawn(move || {
                    table.leave("contested", leaver, |_| {});
                })
            };
            let joiner = Uuid::new_v4();
            let t2 = {
                let table = table.clone();
                std::thread::spawn(move || {
                    table.join("contested", joiner, "joiner", |_| {}).unwrap();
                })
            };
            t1.join().unwrap();
            t2.join().unwrap();

            assert!(table.is_member("contested", joiner));
            table.leave("contested", joiner, |_| {});
        }
    }
}
