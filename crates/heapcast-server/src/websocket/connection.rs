//! WebSocket client connection: the engine's [`Session`] implementation and
//! the per-connection read/write loops.
//!
//! Push frames travel as binary messages; request replies travel as text.
//! Both share one bounded channel, so a reply always precedes the frames the
//! engine sends after it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use heapcast_core::ids::SessionId;
use heapcast_core::protocol::ProtocolVersion;
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::handler;
use super::server::AppState;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::transport::{Session, SessionRef, TransportError};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A connected WebSocket client.
pub struct ClientConnection {
    id: SessionId,
    version: ProtocolVersion,
    tx: mpsc::Sender<Message>,
    capacity: usize,
    closed: CancellationToken,
    dropped_frames: AtomicU64,
    connected_at: Instant,
}

impl ClientConnection {
    /// Create a connection writing into `tx`, which holds `capacity` messages.
    pub fn new(version: ProtocolVersion, tx: mpsc::Sender<Message>, capacity: usize) -> Self {
        Self {
            id: SessionId::new(),
            version,
            tx,
            capacity,
            closed: CancellationToken::new(),
            dropped_frames: AtomicU64::new(0),
            connected_at: Instant::now(),
        }
    }

    /// Queue a request reply.
    pub fn send_reply(&self, json: String) -> Result<(), TransportError> {
        self.enqueue(Message::Text(json.into()))
    }

    /// Frames refused because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Whether [`Session::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    fn enqueue(&self, message: Message) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }
}

impl Session for ClientConnection {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        self.enqueue(Message::Binary(frame))
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Drive one upgraded socket until either side goes away, then release
/// everything the session held in the engine.
pub async fn handle_ws_connection(socket: WebSocket, state: AppState, version: ProtocolVersion) {
    let capacity = state.settings.server.send_queue_capacity.max(1);
    let (tx, mut rx) = mpsc::channel::<Message>(capacity);
    let connection = Arc::new(ClientConnection::new(version, tx, capacity));
    let session: SessionRef = connection.clone();
    let session_id = session.id().clone();

    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(session_id = %session_id, version = version.number(), "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: forward queued messages to the socket, plus periodic pings.
    let closed = connection.closed.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        let _ = ping_interval.tick().await;
        loop {
            tokio::select! {
                () = closed.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => {
                        if ws_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    trace!("sent ping");
                }
            }
        }
        closed.cancel();
        let _ = ws_tx.close().await;
    });

    // Reader: dispatch requests until the client leaves or the writer fails.
    let closed = connection.closed.clone();
    loop {
        let next = tokio::select! {
            () = closed.cancelled() => break,
            next = ws_rx.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                handler::handle_message(text.as_str(), &connection, &state);
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                debug!(session_id = %session_id, %error, "socket read failed");
                break;
            }
        }
    }

    session.close();
    state.manager.session_closed(&session_id);
    let _ = writer.await;

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(
        session_id = %session_id,
        dropped_frames = connection.drop_count(),
        age_secs = connection.age().as_secs(),
        "client disconnected"
    );
}
