use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;

use convgate_core::errors::GatewayError;
use convgate_core::ids::SessionId;

use crate::broadcaster::SessionRegistry;

const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// Item in a session's outbound FIFO.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Close,
}

/// One open WebSocket connection.
///
/// Outbound frames go through a private unbounded FIFO drained by a single
/// writer task, so frames reach the client whole and in enqueue order no
/// matter how many threads send concurrently.
pub struct Session {
    id: SessionId,
    tx: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
    opened_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Session {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: SessionId::new(),
            tx,
            open: AtomicBool::new(true),
            opened_at: Utc::now(),
        });
        (session, rx)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Enqueue one text frame. Returns false, dropping the frame, once the
    /// session is closed.
    pub fn send(&self, frame: String) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    /// Idempotent. Frames already queued are still flushed before the
    /// close frame.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Outbound::Close);
        }
    }
}

/// Receives every inbound text frame of a session.
///
/// Called on the session's reader task; the next frame is not read until
/// `on_frame` returns.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, session: &Arc<Session>, frame: &str);
}

/// Drive one connection until either side closes it.
pub async fn run_session(
    socket: WebSocket,
    session: Arc<Session>,
    rx: mpsc::UnboundedReceiver<Outbound>,
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn FrameHandler>,
    heartbeat: Duration,
) {
    let (ws_tx, mut ws_rx) = socket.split();

    let mut writer = tokio::spawn(write_loop(ws_tx, rx, Arc::clone(&session), heartbeat));

    // Reader: one frame at a time, handled to completion before the next.
    let reader_session = Arc::clone(&session);
    let mut reader = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => handler.on_frame(&reader_session, text.as_str()),
                Ok(WsMessage::Binary(_)) => {
                    tracing::warn!(session_id = %reader_session.id(), "ignoring binary frame");
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    let err = GatewayError::transport(e);
                    tracing::debug!(session_id = %reader_session.id(), error = %err, "read failed");
                    break;
                }
            }
            if !reader_session.is_open() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => {}
    }

    session.close();
    registry.remove(session.id());
    tracing::info!(
        session_id = %session.id(),
        open_sessions = registry.count(),
        "session closed"
    );
}

/// Drain the outbound FIFO into `sink` one frame at a time, pinging every
/// `heartbeat`. Closes the session when the queue ends or a write fails.
async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    session: Arc<Session>,
    heartbeat: Duration,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping_interval = tokio::time::interval(heartbeat.max(MIN_HEARTBEAT));
    ping_interval.tick().await;

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(Outbound::Frame(text)) => {
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            let err = GatewayError::transport(e);
                            tracing::debug!(session_id = %session.id(), error = %err, "write failed");
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Default::default())).await {
                    let err = GatewayError::transport(e);
                    tracing::debug!(session_id = %session.id(), error = %err, "heartbeat failed");
                    break;
                }
                tracing::trace!(session_id = %session.id(), "sent ping");
            }
        }
    }
    session.close();
}
