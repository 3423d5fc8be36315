//! Fan-out of one event to every member of a room.
//!
//! The router is the only component that reads the presence table for
//! delivery purposes. Events are encoded once and shared as `Arc` frames
//! across all recipients; delivery is an unbounded channel enqueue per
//! member, so fanning out never blocks and never fails outward — a
//! connection mid-teardown is silently skipped. Stats are atomics, no lock
//! is taken on the delivery path beyond the member snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::presence::RoomTable;
use crate::protocol::{ConnectionId, Member, ProtocolError, ServerEvent};
use crate::registry::ConnectionRegistry;

/// Snapshot of delivery counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterStats {
    /// Broadcasts performed (one per event, regardless of fan-out width).
    pub events_sent: u64,
    /// Frames accepted into a member's outbound queue.
    pub frames_delivered: u64,
    /// Frames skipped because the member was unreachable.
    pub frames_dropped: u64,
}

/// Routes events to the members of a room.
pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    table: Arc<RoomTable>,
    events_sent: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, table: Arc<RoomTable>) -> Self {
        Self {
            registry,
            table,
            events_sent: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Deliver `event` to every current member of `room_id` except the
    /// optionally excluded connection (the sender of an ephemeral event
    /// already has the authoritative local value — echoing it back only
    /// wastes bandwidth and flickers its UI).
    ///
    /// Returns the number of members the frame was enqueued to.
    pub fn broadcast_to_room(
        &self,
        room_id: &str,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        let members = self.table.members(room_id);
        self.deliver(&members, event, exclude)
    }

    /// Deliver `event` to every current member of `room_id`, no exclusion.
    /// Used for events whose canonical result every member needs, the actor
    /// included (presence lists, room deletion).
    pub fn broadcast_to_room_all(
        &self,
        room_id: &str,
        event: &ServerEvent,
    ) -> Result<usize, ProtocolError> {
        self.broadcast_to_room(room_id, event, None)
    }

    /// Encode once and enqueue to an explicit member list. The presence
    /// handlers call this from inside the room's critical section with the
    /// post-mutation snapshot, which is what keeps per-room broadcasts in
    /// mutation order.
    pub fn deliver(
        &self,
        members: &[Member],
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(event.encode()?);
        let mut delivered = 0u64;
        let mut dropped = 0u64;

        for member in members {
            if Some(member.connection_id) == exclude {
                continue;
            }
            if self.registry.send(member.connection_id, frame.clone()) {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }

        self.events_sent.fetch_add(1, Ordering::Relaxed);
        self.frames_delivered.fetch_add(delivered, Ordering::Relaxed);
        self.frames_dropped.fetch_add(dropped, Ordering::Relaxed);
        Ok(delivered as usize)
    }

    /// Send an event to a single connection (rejected-event notices,
    /// heartbeat responses). Best-effort like everything else.
    pub fn send_to(
        &self,
        connection_id: ConnectionId,
        event: &ServerEvent,
    ) -> Result<bool, ProtocolError> {
        let frame = Arc::new(event.encode()?);
        let accepted = self.registry.send(connection_id, frame);
        if accepted {
            self.frames_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(accepted)
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use uuid::Uuid;

    fn setup() -> (Arc<ConnectionRegistry>, Arc<RoomTable>, BroadcastRouter) {
        let registry = Arc::new(ConnectionRegistry::new());
        let table = Arc::new(RoomTable::new());
        let router = BroadcastRouter::new(registry.clone(), table.clone());
        (registry, table, router)
    }

    fn connect(
        registry: &ConnectionRegistry,
        table: &RoomTable,
        room: &str,
        identity: &str,
    ) -> (ConnectionId, UnboundedReceiver<Arc<Vec<u8>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.register(tx);
        table.join(room, conn, identity, |_| {}).unwrap();
        (conn, rx)
    }

    fn recv_event(rx: &mut UnboundedReceiver<Arc<Vec<u8>>>) -> ServerEvent {
        let frame = rx.try_recv().expect("expected a frame");
        ServerEvent::decode(&frame).unwrap()
    }

    #[test]
    fn test_broadcast_reaches_all_members() {
        let (registry, table, router) = setup();
        let (_a, mut rx_a) = connect(&registry, &table, "r1", "alice");
        let (_b, mut rx_b) = connect(&registry, &table, "r1", "bob");

        let event = ServerEvent::TaskChanged { room_id: "r1".into() };
        let delivered = router.broadcast_to_room_all("r1", &event).unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(recv_event(&mut rx_a), event);
        assert_eq!(recv_event(&mut rx_b), event);
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let (registry, table, router) = setup();
        let (a, mut rx_a) = connect(&registry, &table, "r1", "alice");
        let (_b, mut rx_b) = connect(&registry, &table, "r1", "bob");

        let event = ServerEvent::Typing {
            room_id: "r1".into(),
            identity: "alice".into(),
            is_typing: true,
        };
        let delivered = router.broadcast_to_room("r1", &event, Some(a)).unwrap();
        assert_eq!(delivered, 1);

        assert!(rx_a.try_recv().is_err(), "sender must not be echoed");
        assert_eq!(recv_event(&mut rx_b), event);
    }

    #[test]
    fn test_broadcast_to_unknown_room_is_empty() {
        let (_registry, _table, router) = setup();
        let event = ServerEvent::TaskChanged { room_id: "nope".into() };
        assert_eq!(router.broadcast_to_room_all("nope", &event).unwrap(), 0);
    }

    #[test]
    fn test_dead_member_is_skipped_silently() {
        let (registry, table, router) = setup();
        let (_a, mut rx_a) = connect(&registry, &table, "r1", "alice");
        let (_b, rx_b) = connect(&registry, &table, "r1", "bob");
        drop(rx_b); // bob's connection task is gone mid-broadcast

        let event = ServerEvent::TaskChanged { room_id: "r1".into() };
        let delivered = router.broadcast_to_room_all("r1", &event).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(recv_event(&mut rx_a), event);

        let stats = router.stats();
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.frames_delivered, 1);
    }

    #[test]
    fn test_send_to_single_connection() {
        let (registry, table, router) = setup();
        let (a, mut rx_a) = connect(&registry, &table, "r1", "alice");
        let (_b, mut rx_b) = connect(&registry, &table, "r1", "bob");

        let notice = ServerEvent::Rejected { reason: "bad frame".into() };
        assert!(router.send_to(a, &notice).unwrap());

        assert_eq!(recv_event(&mut rx_a), notice);
        assert!(rx_b.try_recv().is_err(), "notices go only to the originator");
    }

    #[test]
    fn test_stats_count_events() {
        let (registry, table, router) = setup();
        let (_a, _rx_a) = connect(&registry, &table, "r1", "alice");

        let event = ServerEvent::TaskChanged { room_id: "r1".into() };
        router.broadcast_to_room_all("r1", &event).unwrap();
        router.broadcast_to_room_all("r1", &event).unwrap();

        let stats = router.stats();
        assert_eq!(stats.events_sent, 2);
        assert_eq!(stats.frames_delivered, 2);
    }
}
