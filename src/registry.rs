//! Connection registry: one entry per live transport connection.
//!
//! An entry holds the connection's identity (unset until the first join),
//! the set of rooms it currently belongs to, and the outbound delivery
//! handle the router enqueues frames into. Entries are created on transport
//! accept and destroyed on disconnect; teardown hands the joined-room set
//! back to the caller so it can drive per-room cleanup.
//!
//! No method here ever blocks on I/O: delivery is an unbounded channel send
//! and the registry lock is only held for map operations, so callers may
//! invoke the registry from inside a room's critical section.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ConnectionId;

/// Pre-encoded outbound frame, shared across all recipients of a broadcast.
pub type Frame = Arc<Vec<u8>>;

/// Sender half of a connection's outbound queue. The connection task owns
/// the receiver and drains it into the WebSocket sink in order.
pub type OutboundSender = mpsc::UnboundedSender<Frame>;

struct ConnectionEntry {
    identity: Option<String>,
    joined_rooms: HashSet<String>,
    outbound: OutboundSender,
}

/// Registry of live connections.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Create an entry for a new transport connection and return its id.
    pub fn register(&self, outbound: OutboundSender) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        let mut connections = self.connections.write().unwrap_or_else(|p| p.into_inner());
        connections.insert(
            connection_id,
            ConnectionEntry {
                identity: None,
                joined_rooms: HashSet::new(),
                outbound,
            },
        );
        connection_id
    }

    /// Bind the connection's identity. Identity is set at most once; a
    /// conflicting re-set is a logged no-op, a redundant identical set is
    /// tolerated. Returns the identity now in effect, or `None` if the
    /// connection is gone.
    pub fn set_identity(&self, connection_id: ConnectionId, identity: &str) -> Option<String> {
        let mut connections = self.connections.write().unwrap_or_else(|p| p.into_inner());
        let entry = connections.get_mut(&connection_id)?;
        match &entry.identity {
            None => {
                entry.identity = Some(identity.to_string());
                Some(identity.to_string())
            }
            Some(existing) if existing == identity => Some(existing.clone()),
            Some(existing) => {
                log::warn!(
                    "Connection {connection_id} attempted identity change \
                     {existing:?} -> {identity:?}; keeping {existing:?}"
                );
                Some(existing.clone())
            }
        }
    }

    /// The connection's identity, if it has announced one.
    pub fn identity(&self, connection_id: ConnectionId) -> Option<String> {
        let connections = self.connections.read().unwrap_or_else(|p| p.into_inner());
        connections.get(&connection_id)?.identity.clone()
    }

    /// Record that the connection joined a room. Returns `false` if the
    /// connection has already been torn down, in which case the caller must
    /// not touch the presence table — a late join must never resurrect a
    /// phantom membership.
    pub fn track_join(&self, connection_id: ConnectionId, room_id: &str) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(|p| p.into_inner());
        match connections.get_mut(&connection_id) {
            Some(entry) => {
                entry.joined_rooms.insert(room_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Record that the connection left a room.
    pub fn untrack_join(&self, connection_id: ConnectionId, room_id: &str) {
        let mut connections = self.connections.write().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = connections.get_mut(&connection_id) {
            entry.joined_rooms.remove(room_id);
        }
    }

    /// Strip a room from several connections at once (room-deletion path).
    pub fn untrack_room(&self, connection_ids: &[ConnectionId], room_id: &str) {
        let mut connections = self.connections.write().unwrap_or_else(|p| p.into_inner());
        for connection_id in connection_ids {
            if let Some(entry) = connections.get_mut(connection_id) {
                entry.joined_rooms.remove(room_id);
            }
        }
    }

    /// Remove the connection's entry and return the rooms it belonged to.
    /// Idempotent: a second teardown returns the empty set.
    pub fn teardown(&self, connection_id: ConnectionId) -> HashSet<String> {
        let mut connections = self.connections.write().unwrap_or_else(|p| p.into_inner());
        match connections.remove(&connection_id) {
            Some(entry) => entry.joined_rooms,
            None => HashSet::new(),
        }
    }

    /// The rooms a connection currently belongs to, or `None` if it no
    /// longer exists.
    pub fn joined_rooms(&self, connection_id: ConnectionId) -> Option<HashSet<String>> {
        let connections = self.connections.read().unwrap_or_else(|p| p.into_inner());
        connections
            .get(&connection_id)
            .map(|entry| entry.joined_rooms.clone())
    }

    /// Enqueue a frame to one connection. Best-effort: an absent entry or a
    /// closed receiver means the connection is mid-teardown and the frame is
    /// silently dropped. Returns whether the frame was accepted.
    pub fn send(&self, connection_id: ConnectionId, frame: Frame) -> bool {
        let connections = self.connections.read().unwrap_or_else(|p| p.into_inner());
        match connections.get(&connection_id) {
            Some(entry) => entry.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        let connections = self.connections.read().unwrap_or_else(|p| p.into_inner());
        connections.contains_key(&connection_id)
    }

    pub fn connection_count(&self) -> usize {
        let connections = self.connections.read().unwrap_or_else(|p| p.into_inner());
        connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
