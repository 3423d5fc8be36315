//! WebSocket front end for the presence engine.
//!
//! ```text
//! Client A ──┐                      ┌── outbound queue ── Client A
//!             ├── RoomEngine ───────┤
//! Client B ──┘   (registry +        └── outbound queue ── Client B
//!                 presence table +
//!                 router)
//! ```
//!
//! Each accepted connection gets one task that owns both halves of the
//! socket. Inbound frames are decoded and handled inline, so all of a
//! connection's events flow through a single ordered path; outbound frames
//! arrive pre-encoded on the connection's unbounded queue and are drained
//! into the sink in enqueue order. The engine itself never performs I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::engine::RoomEngine;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Maximum members per room; joins past the limit are refused.
    pub max_members_per_room: usize,
    /// Interval between WebSocket-level pings to each connection.
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
            max_members_per_room: 100,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Counters are atomics so the per-connection tasks never contend on a
/// stats lock.
#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// The board presence server.
pub struct BoardServer {
    config: ServerConfig,
    engine: Arc<RoomEngine>,
    stats: Arc<AtomicServerStats>,
}

impl BoardServer {
    /// Create a server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let engine = Arc::new(RoomEngine::new(config.max_members_per_room));
        Self {
            config,
            engine,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// The engine behind this server, for in-process use.
    pub fn engine(&self) -> &Arc<RoomEngine> {
        &self.engine
    }

    /// The configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.engine.table().room_count(),
        }
    }

    /// Accept and serve connections. Runs until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Board server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();
            let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval_secs);

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, engine, stats, heartbeat_interval).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Serve a single WebSocket connection until it closes, then tear its
    /// presence state down.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<RoomEngine>,
        stats: Arc<AtomicServerStats>,
        heartbeat_interval: Duration,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let connection_id = engine.register(out_tx);
        log::info!("Connection {connection_id} established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                            engine.handle_frame(connection_id, &bytes);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {connection_id} closed ({addr})");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = out_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if ws_sender
                                .send(Message::Binary(frame.to_vec().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        // Teardown must run on every exit path so no room keeps a dead
        // member.
        engine.handle_disconnect(connection_id);
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        Ok(())
    }
}
