//! Event handlers: one short, idempotent transaction per inbound event.
//!
//! ```text
//! ClientEvent ──► validate ──► presence mutation ──► broadcast
//!                    │              (≤ 1 room)          │
//!                    └── Rejected notice            members only
//! ```
//!
//! There is no state machine over a connection beyond membership
//! bookkeeping. Each handler performs a bounded set of presence-table
//! mutations and hands the post-mutation snapshot to the router from inside
//! the room's critical section. No handler can fail in a way that corrupts
//! the table: malformed events are dropped at the boundary, events for
//! rooms the sender is not a member of are logged no-ops (a spoofed event
//! must not inject presence entries), and delivery failures never surface.
//!
//! All of one connection's events arrive through its connection task, so
//! operations for a given connection are totally ordered; a join processed
//! after teardown began is refused by the registry and cannot resurrect a
//! phantom membership.

use std::sync::Arc;

use crate::presence::{PresenceError, RoomTable};
use crate::protocol::{ClientEvent, ConnectionId, ServerEvent};
use crate::registry::{ConnectionRegistry, OutboundSender};
use crate::router::BroadcastRouter;

/// The presence and broadcast engine. Owns the registry, the presence
/// table, and the router; the transport layer feeds it decoded frames.
pub struct RoomEngine {
    registry: Arc<ConnectionRegistry>,
    table: Arc<RoomTable>,
    router: Arc<BroadcastRouter>,
}

impl RoomEngine {
    /// Create an engine whose rooms refuse joins past `member_limit`.
    pub fn new(member_limit: usize) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let table = Arc::new(RoomTable::with_member_limit(member_limit));
        let router = Arc::new(BroadcastRouter::new(registry.clone(), table.clone()));
        Self {
            registry,
            table,
            router,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn table(&self) -> &Arc<RoomTable> {
        &self.table
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }

    /// Register a new transport connection. `outbound` is where broadcasts
    /// for this connection get enqueued; the connection task drains it.
    pub fn register(&self, outbound: OutboundSender) -> ConnectionId {
        let connection_id = self.registry.register(outbound);
        log::debug!("Connection {connection_id} registered");
        connection_id
    }

    /// Decode, validate, and dispatch one inbound frame. Undecodable or
    /// invalid frames are dropped here with a `Rejected` notice to the
    /// originator; nothing reaches the presence table.
    pub fn handle_frame(&self, connection_id: ConnectionId, bytes: &[u8]) {
        let event = match ClientEvent::decode(bytes) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping undecodable frame from {connection_id}: {e}");
                self.reject(connection_id, "malformed event");
                return;
            }
        };
        if let Err(e) = event.validate() {
            log::warn!("Dropping invalid event from {connection_id}: {e}");
            self.reject(connection_id, &e.to_string());
            return;
        }
        self.handle_event(connection_id, event);
    }

    /// Dispatch a validated event to its handler.
    pub fn handle_event(&self, connection_id: ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::Join { room_id, identity } => {
                self.handle_join(connection_id, &room_id, &identity)
            }
            ClientEvent::Leave { room_id } => self.handle_leave(connection_id, &room_id),
            ClientEvent::TaskChanged { room_id } => {
                self.handle_task_changed(connection_id, &room_id)
            }
            ClientEvent::Typing { room_id, is_typing, .. } => {
                self.handle_typing(connection_id, &room_id, is_typing)
            }
            ClientEvent::PointerMove { room_id, x, y, .. } => {
                self.handle_pointer_move(connection_id, &room_id, x, y)
            }
            ClientEvent::RoomDeleted { room_id } => {
                self.handle_room_deleted(connection_id, &room_id)
            }
            ClientEvent::Ping => {
                let _ = self.router.send_to(connection_id, &ServerEvent::Pong);
            }
        }
    }

    /// Transport-level disconnect: tear the connection down and announce
    /// the updated member list to every room it belonged to.
    pub fn handle_disconnect(&self, connection_id: ConnectionId) {
        let rooms = self.registry.teardown(connection_id);
        if rooms.is_empty() {
            log::debug!("Connection {connection_id} disconnected (no rooms)");
            return;
        }
        log::info!(
            "Connection {connection_id} disconnected, leaving {} room(s)",
            rooms.len()
        );
        self.table
            .remove_from_all_rooms(connection_id, rooms, |room_id, members| {
                if !members.is_empty() {
                    self.announce_presence(room_id, members);
                }
            });
    }

    fn handle_join(&self, connection_id: ConnectionId, room_id: &str, identity: &str) {
        // Registry first: a connection already torn down must not be able
        // to re-enter the presence table.
        if !self.registry.track_join(connection_id, room_id) {
            log::debug!("Join from dead connection {connection_id} ignored");
            return;
        }
        // The room entry always carries the registry-bound identity, so the
        // presence list and ephemeral broadcasts can never disagree about
        // who a connection is.
        let identity = self
            .registry
            .set_identity(connection_id, identity)
            .unwrap_or_else(|| identity.to_string());

        let result = self.table.join(room_id, connection_id, &identity, |members| {
            self.announce_presence(room_id, members);
        });
        match result {
            Ok(_) => log::info!("{identity} joined room {room_id}"),
            Err(e @ PresenceError::RoomFull { .. }) => {
                self.registry.untrack_join(connection_id, room_id);
                log::warn!("Join refused for {connection_id}: {e}");
                self.reject(connection_id, &e.to_string());
            }
        }
    }

    fn handle_leave(&self, connection_id: ConnectionId, room_id: &str) {
        self.registry.untrack_join(connection_id, room_id);
        self.table.leave(room_id, connection_id, |members| {
            // Skipped when the room just emptied: it no longer exists and
            // there is nobody left to tell.
            if !members.is_empty() {
                self.announce_presence(room_id, members);
            }
        });
        log::info!("Connection {connection_id} left room {room_id}");
    }

    fn handle_task_changed(&self, connection_id: ConnectionId, room_id: &str) {
        if !self.table.is_member(room_id, connection_id) {
            log::debug!("taskChanged from non-member {connection_id} for {room_id} ignored");
            return;
        }
        let event = ServerEvent::TaskChanged { room_id: room_id.to_string() };
        if let Err(e) = self.router.broadcast_to_room(room_id, &event, Some(connection_id)) {
            log::error!("taskChanged broadcast failed for {room_id}: {e}");
        }
    }

    fn handle_typing(&self, connection_id: ConnectionId, room_id: &str, is_typing: bool) {
        if !self.table.is_member(room_id, connection_id) {
            log::debug!("typing from non-member {connection_id} for {room_id} ignored");
            return;
        }
        let Some(identity) = self.registry.identity(connection_id) else {
            return;
        };
        let event = ServerEvent::Typing {
            room_id: room_id.to_string(),
            identity,
            is_typing,
        };
        if let Err(e) = self.router.broadcast_to_room(room_id, &event, Some(connection_id)) {
            log::error!("typing broadcast failed for {room_id}: {e}");
        }
    }

    fn handle_pointer_move(&self, connection_id: ConnectionId, room_id: &str, x: f32, y: f32) {
        if !self.table.is_member(room_id, connection_id) {
            log::trace!("pointer from non-member {connection_id} for {room_id} ignored");
            return;
        }
        let Some(identity) = self.registry.identity(connection_id) else {
            return;
        };
        log::trace!("pointer update in room {room_id}");
        let event = ServerEvent::PointerMove {
            room_id: room_id.to_string(),
            connection_id,
            identity,
            x,
            y,
        };
        if let Err(e) = self.router.broadcast_to_room(room_id, &event, Some(connection_id)) {
            log::error!("pointer broadcast failed for {room_id}: {e}");
        }
    }

    fn handle_room_deleted(&self, connection_id: ConnectionId, room_id: &str) {
        // Deletion authority was checked by the task store before this
        // event was accepted; every remaining member, the actor included,
        // needs the deletion notice.
        let evicted = self.table.delete_room(room_id, |members| {
            let event = ServerEvent::RoomDeleted { room_id: room_id.to_string() };
            if let Err(e) = self.router.deliver(members, &event, None) {
                log::error!("roomDeleted broadcast failed for {room_id}: {e}");
            }
        });
        if !evicted.is_empty() {
            let ids: Vec<ConnectionId> = evicted.iter().map(|m| m.connection_id).collect();
            self.registry.untrack_room(&ids, room_id);
        }
        log::info!("Room {room_id} deleted by {connection_id}");
    }

    fn announce_presence(&self, room_id: &str, members: &[crate::protocol::Member]) {
        let event = ServerEvent::Presence {
            room_id: room_id.to_string(),
            members: members.to_vec(),
        };
        if let Err(e) = self.router.deliver(members, &event, None) {
            log::error!("presence broadcast failed for {room_id}: {e}");
        }
    }

    fn reject(&self, connection_id: ConnectionId, reason: &str) {
        let notice = ServerEvent::Rejected { reason: reason.to_string() };
        let _ = self.router.send_to(connection_id, &notice);
    }
}
