//! # taskboard-collab — Real-time presence layer for the task board
//!
//! Provides WebSocket-based room presence and event broadcast: who is
//! looking at which board, and live fan-out of task changes, typing
//! indicators, and pointer positions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ BoardClient │ ◄─────────────────► │ BoardServer │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │ RoomEngine  │
//!                                     └──────┬──────┘
//!                            ┌───────────────┼───────────────┐
//!                            ▼               ▼               ▼
//!                     ┌────────────┐  ┌────────────┐  ┌────────────┐
//!                     │ Connection │  │ RoomTable  │  │ Broadcast  │
//!                     │ Registry   │  │ (presence) │  │ Router     │
//!                     └────────────┘  └────────────┘  └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded client/server events)
//! - [`registry`] — Connection identity and outbound queues
//! - [`presence`] — Room membership table with lifecycle rules
//! - [`router`] — Room-based fan-out with sender exclusion
//! - [`engine`] — Event dispatch tying the three together
//! - [`server`] — WebSocket presence server
//! - [`client`] — WebSocket client with pointer rate limiting
//!
//! The engine is transport-free: the integration tests drive it directly
//! with in-process channels, and the server is a thin WebSocket front end.

pub mod protocol;
pub mod registry;
pub mod presence;
pub mod router;
pub mod engine;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ClientEvent, ConnectionId, Member, ProtocolError, ServerEvent, POINTER_COORD_MAX,
};
pub use registry::{ConnectionRegistry, Frame, OutboundSender};
pub use presence::{PresenceError, RoomTable};
pub use router::{BroadcastRouter, RouterStats};
pub use engine::RoomEngine;
pub use server::{BoardServer, ServerConfig, ServerStats};
pub use client::{BoardClient, BoardEvent, ClientState, PointerThrottle};
