//! WebSocket client for the board presence server.
//!
//! Used by the desktop/web front ends and by the integration tests.
//! Provides connection lifecycle, join/leave, the ephemeral sends (task
//! change, typing, pointer), and a typed event stream. Pointer updates are
//! rate-limited client side to 20/s — the server fans out whatever arrives,
//! so a polite sender is the only thing standing between a busy mouse and
//! the room's bandwidth.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{ClientEvent, ConnectionId, Member, ProtocolError, ServerEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted to the application.
#[derive(Debug, Clone)]
pub enum BoardEvent {
    /// Connection established.
    Connected,
    /// Connection lost.
    Disconnected,
    /// Updated member list for a room we are in.
    Presence {
        room_id: String,
        members: Vec<Member>,
    },
    /// A board's task data changed; re-fetch it from the store.
    TaskChanged { room_id: String },
    /// Another member's typing state changed.
    Typing {
        room_id: String,
        identity: String,
        is_typing: bool,
    },
    /// Another member's pointer moved.
    PointerMove {
        room_id: String,
        connection_id: ConnectionId,
        identity: String,
        x: f32,
        y: f32,
    },
    /// A room we were in was deleted.
    RoomDeleted { room_id: String },
    /// The server dropped one of our events.
    Rejected { reason: String },
    /// Heartbeat response.
    Pong,
}

/// Rate limiter for pointer updates (default 50ms between sends = 20/s).
pub struct PointerThrottle {
    last_send: Instant,
    min_interval: Duration,
}

impl PointerThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            // Backdate so the first update goes out immediately.
            last_send: Instant::now() - min_interval,
            min_interval,
        }
    }

    /// Whether a pointer update may be sent now; marks the send if so.
    pub fn allow(&mut self) -> bool {
        if self.last_send.elapsed() >= self.min_interval {
            self.last_send = Instant::now();
            true
        } else {
            false
        }
    }
}

impl Default for PointerThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

/// The board presence client.
pub struct BoardClient {
    /// Who we are on the board; sent with join.
    identity: String,
    /// Connection state, shared with the reader task.
    state: Arc<RwLock<ClientState>>,
    /// Channel to the WebSocket writer task.
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Event receiver handed to the application.
    event_rx: Option<mpsc::Receiver<BoardEvent>>,
    /// Event sender (cloned into the reader task).
    event_tx: mpsc::Sender<BoardEvent>,
    /// Pointer-update rate limiter.
    throttle: Mutex<PointerThrottle>,
    /// Server URL.
    server_url: String,
}

impl BoardClient {
    /// Create a client for the given identity and server URL.
    pub fn new(identity: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            identity: identity.into(),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            throttle: Mutex::new(PointerThrottle::default()),
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<BoardEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader/writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.set_state(ClientState::Connecting);

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await
        {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.server_url);
                self.set_state(ClientState::Disconnected);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel into the sink.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            // The outgoing channel closed: the client disconnected or was
            // dropped. Say goodbye so the server tears our presence down
            // now instead of waiting for a TCP or heartbeat timeout.
            let _ = ws_writer
                .send(tokio_tungstenite::tungstenite::Message::Close(None))
                .await;
        });

        self.set_state(ClientState::Connected);
        let _ = self.event_tx.send(BoardEvent::Connected).await;

        // Reader task: decode server frames into BoardEvents.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerEvent::decode(&bytes) {
                            Ok(event) => {
                                let _ = event_tx.send(Self::map_event(event)).await;
                            }
                            Err(e) => {
                                log::warn!("Undecodable server frame: {e}");
                            }
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().unwrap_or_else(|p| p.into_inner()) = ClientState::Disconnected;
            let _ = event_tx.send(BoardEvent::Disconnected).await;
        });

        Ok(())
    }

    fn map_event(event: ServerEvent) -> BoardEvent {
        match event {
            ServerEvent::Presence { room_id, members } => {
                BoardEvent::Presence { room_id, members }
            }
            ServerEvent::TaskChanged { room_id } => BoardEvent::TaskChanged { room_id },
            ServerEvent::Typing { room_id, identity, is_typing } => BoardEvent::Typing {
                room_id,
                identity,
                is_typing,
            },
            ServerEvent::PointerMove { room_id, connection_id, identity, x, y } => {
                BoardEvent::PointerMove { room_id, connection_id, identity, x, y }
            }
            ServerEvent::RoomDeleted { room_id } => BoardEvent::RoomDeleted { room_id },
            ServerEvent::Rejected { reason } => BoardEvent::Rejected { reason },
            ServerEvent::Pong => BoardEvent::Pong,
        }
    }

    /// Close the connection. Dropping the outgoing channel makes the writer
    /// task send a WebSocket close frame, so the server removes us from
    /// every presence list immediately. The reader task emits
    /// [`BoardEvent::Disconnected`] once the server acknowledges.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
        self.set_state(ClientState::Disconnected);
    }

    /// Join a board room. Requires a live connection.
    pub async fn join(&self, room_id: &str) -> Result<(), ProtocolError> {
        self.send_event(&ClientEvent::Join {
            room_id: room_id.to_string(),
            identity: self.identity.clone(),
        })
        .await
    }

    /// Leave a board room.
    pub async fn leave(&self, room_id: &str) -> Result<(), ProtocolError> {
        self.send_event(&ClientEvent::Leave { room_id: room_id.to_string() })
            .await
    }

    /// Tell the room its task data changed. Silently dropped when offline —
    /// members will see the change on their next fetch anyway.
    pub async fn notify_task_changed(&self, room_id: &str) -> Result<(), ProtocolError> {
        if self.state() != ClientState::Connected {
            return Ok(());
        }
        self.send_event(&ClientEvent::TaskChanged { room_id: room_id.to_string() })
            .await
    }

    /// Send a typing-state toggle. Silently dropped when offline.
    pub async fn send_typing(&self, room_id: &str, is_typing: bool) -> Result<(), ProtocolError> {
        if self.state() != ClientState::Connected {
            return Ok(());
        }
        self.send_event(&ClientEvent::Typing {
            room_id: room_id.to_string(),
            identity: self.identity.clone(),
            is_typing,
        })
        .await
    }

    /// Send a pointer position (percent of viewport, `[0, 100]`).
    ///
    /// Rate-limited; returns `Ok(false)` when the update was throttled.
    /// Silently dropped when offline.
    pub async fn send_pointer(&self, room_id: &str, x: f32, y: f32) -> Result<bool, ProtocolError> {
        if self.state() != ClientState::Connected {
            return Ok(false);
        }
        {
            let mut throttle = self.throttle.lock().unwrap_or_else(|p| p.into_inner());
            if !throttle.allow() {
                return Ok(false);
            }
        }
        self.send_event(&ClientEvent::PointerMove {
            room_id: room_id.to_string(),
            identity: self.identity.clone(),
            x,
            y,
        })
        .await?;
        Ok(true)
    }

    /// Send a pointer position regardless of rate limiting (e.g. the final
    /// position after a drag ends).
    pub async fn force_pointer(&self, room_id: &str, x: f32, y: f32) -> Result<(), ProtocolError> {
        if self.state() != ClientState::Connected {
            return Ok(());
        }
        self.send_event(&ClientEvent::PointerMove {
            room_id: room_id.to_string(),
            identity: self.identity.clone(),
            x,
            y,
        })
        .await
    }

    /// Announce that a room's board was deleted. The REST call that deleted
    /// the board checks authority; this only spreads the news.
    pub async fn notify_room_deleted(&self, room_id: &str) -> Result<(), ProtocolError> {
        self.send_event(&ClientEvent::RoomDeleted { room_id: room_id.to_string() })
            .await
    }

    /// Application-level heartbeat.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_event(&ClientEvent::Ping).await
    }

    async fn send_event(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        event.validate()?;
        if self.state() != ClientState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = event.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn set_state(&self, new: ClientState) {
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = new;
    }

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Our identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
