//! Wire protocol for the real-time board overlay.
//!
//! All frames are bincode-encoded enums sent as WebSocket binary messages:
//!
//! ```text
//! ┌─────────────┐   ClientEvent    ┌─────────────┐
//! │ BoardClient │ ───────────────► │ BoardServer │
//! │             │ ◄─────────────── │             │
//! └─────────────┘   ServerEvent    └─────────────┘
//! ```
//!
//! Events are signals, not data: `TaskChanged` carries no task payload —
//! receivers re-fetch from the task store. Pointer coordinates are
//! percentages of the viewport, `[0, 100]` on both axes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque connection identifier, assigned by the server at accept time.
/// Stable for the connection's lifetime, never reused.
pub type ConnectionId = Uuid;

/// Upper bound for pointer coordinates (percent of viewport).
pub const POINTER_COORD_MAX: f32 = 100.0;

/// One entry in a room's presence list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Member {
    pub connection_id: ConnectionId,
    pub identity: String,
}

impl Member {
    pub fn new(connection_id: ConnectionId, identity: impl Into<String>) -> Self {
        Self {
            connection_id,
            identity: identity.into(),
        }
    }
}

/// Events sent by clients to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientEvent {
    /// Join a board room. Identity must be non-empty; clients defer this
    /// until they know who they are.
    Join { room_id: String, identity: String },

    /// Leave a board room.
    Leave { room_id: String },

    /// Something in the board's task data changed; members should re-fetch.
    TaskChanged { room_id: String },

    /// Typing indicator toggle.
    Typing {
        room_id: String,
        identity: String,
        is_typing: bool,
    },

    /// Pointer position update (high frequency, sender rate-limits to 20/s).
    PointerMove {
        room_id: String,
        identity: String,
        x: f32,
        y: f32,
    },

    /// The board behind this room was deleted. Authority is checked by the
    /// task store before this event is sent; the engine trusts it.
    RoomDeleted { room_id: String },

    /// Application-level heartbeat.
    Ping,
}

impl ClientEvent {
    /// The room this event targets, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ClientEvent::Join { room_id, .. }
            | ClientEvent::Leave { room_id }
            | ClientEvent::TaskChanged { room_id }
            | ClientEvent::Typing { room_id, .. }
            | ClientEvent::PointerMove { room_id, .. }
            | ClientEvent::RoomDeleted { room_id } => Some(room_id),
            ClientEvent::Ping => None,
        }
    }

    /// Boundary validation. Malformed events are dropped before any
    /// presence mutation happens.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(room_id) = self.room_id() {
            if room_id.is_empty() {
                return Err(ProtocolError::EmptyRoomId);
            }
        }
        match self {
            ClientEvent::Join { identity, .. } if identity.is_empty() => {
                Err(ProtocolError::EmptyIdentity)
            }
            ClientEvent::PointerMove { x, y, .. }
                if !(*x >= 0.0 && *x <= POINTER_COORD_MAX
                    && *y >= 0.0 && *y <= POINTER_COORD_MAX) =>
            {
                Err(ProtocolError::PointerOutOfRange { x: *x, y: *y })
            }
            _ => Ok(()),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }
}

/// Events fanned out by the server to room members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerEvent {
    /// Full member list of a room, sent on every join/leave affecting it.
    /// Receivers must treat the list as a set.
    Presence {
        room_id: String,
        members: Vec<Member>,
    },

    /// Cache-invalidation signal; carries no task data.
    TaskChanged { room_id: String },

    /// A member's typing state changed. Sender excluded.
    Typing {
        room_id: String,
        identity: String,
        is_typing: bool,
    },

    /// A member's pointer moved. Sender excluded.
    PointerMove {
        room_id: String,
        connection_id: ConnectionId,
        identity: String,
        x: f32,
        y: f32,
    },

    /// The room was deleted; every member receives this, including the
    /// actor if still connected.
    RoomDeleted { room_id: String },

    /// An event from this connection was dropped at the boundary. Sent only
    /// to the originator, never to other members.
    Rejected { reason: String },

    /// Heartbeat response.
    Pong,
}

impl ServerEvent {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    EmptyRoomId,
    EmptyIdentity,
    PointerOutOfRange { x: f32, y: f32 },
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::EmptyRoomId => write!(f, "Event is missing a room id"),
            Self::EmptyIdentity => write!(f, "Join requires a non-empty identity"),
            Self::PointerOutOfRange { x, y } => {
                write!(f, "Pointer coordinates out of range: ({x}, {y})")
            }
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_roundtrip() {
        let event = ClientEvent::Join {
            room_id: "board-7".into(),
            identity: "alice@example.com".into(),
        };
        let encoded = event.encode().unwrap();
        let decoded = ClientEvent::decode(&encoded).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_server_event_roundtrip() {
        let event = ServerEvent::Presence {
            room_id: "board-7".into(),
            members: vec![
                Member::new(Uuid::new_v4(), "alice"),
                Member::new(Uuid::new_v4(), "bob"),
            ],
        };
        let encoded = event.encode().unwrap();
        let decoded = ServerEvent::decode(&encoded).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_pointer_move_roundtrip() {
        let conn = Uuid::new_v4();
        let event = ServerEvent::PointerMove {
            room_id: "r1".into(),
            connection_id: conn,
            identity: "alice".into(),
            x: 50.0,
            y: 75.5,
        };
        let encoded = event.encode().unwrap();
        match ServerEvent::decode(&encoded).unwrap() {
            ServerEvent::PointerMove { connection_id, x, y, .. } => {
                assert_eq!(connection_id, conn);
                assert_eq!(x, 50.0);
                assert_eq!(y, 75.5);
            }
            other => panic!("Expected PointerMove, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_join_empty_identity() {
        let event = ClientEvent::Join {
            room_id: "r1".into(),
            identity: String::new(),
        };
        assert_eq!(event.validate(), Err(ProtocolError::EmptyIdentity));
    }

    #[test]
    fn test_validate_empty_room_id() {
        let event = ClientEvent::Leave { room_id: String::new() };
        assert_eq!(event.validate(), Err(ProtocolError::EmptyRoomId));
    }

    #[test]
    fn test_validate_pointer_range() {
        let ok = ClientEvent::PointerMove {
            room_id: "r1".into(),
            identity: "alice".into(),
            x: 0.0,
            y: 100.0,
        };
        assert!(ok.validate().is_ok());

        let out = ClientEvent::PointerMove {
            room_id: "r1".into(),
            identity: "alice".into(),
            x: 100.1,
            y: 50.0,
        };
        assert!(matches!(
            out.validate(),
            Err(ProtocolError::PointerOutOfRange { .. })
        ));

        let negative = ClientEvent::PointerMove {
            room_id: "r1".into(),
            identity: "alice".into(),
            x: -1.0,
            y: 50.0,
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_validate_pointer_nan_rejected() {
        let event = ClientEvent::PointerMove {
            room_id: "r1".into(),
            identity: "alice".into(),
            x: f32::NAN,
            y: 50.0,
        };
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_room_id_accessor() {
        let event = ClientEvent::TaskChanged { room_id: "b".into() };
        assert_eq!(event.room_id(), Some("b"));
        assert_eq!(ClientEvent::Ping.room_id(), None);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ClientEvent::decode(&garbage).is_err());
        assert!(ServerEvent::decode(&garbage).is_err());
    }

    #[test]
    fn test_pointer_event_wire_size() {
        // Pointer frames go out at up to 20/s per member; keep them compact.
        let event = ClientEvent::PointerMove {
            room_id: "board-1234".into(),
            identity: "alice@example.com".into(),
            x: 42.0,
            y: 58.0,
        };
        let encoded = event.encode().unwrap();
        assert!(
            encoded.len() < 64,
            "Pointer frame too large: {} bytes",
            encoded.len()
        );
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let ping = ClientEvent::Ping.encode().unwrap();
        assert_eq!(ClientEvent::decode(&ping).unwrap(), ClientEvent::Ping);

        let pong = ServerEvent::Pong.encode().unwrap();
        assert_eq!(ServerEvent::decode(&pong).unwrap(), ServerEvent::Pong);
    }
}
