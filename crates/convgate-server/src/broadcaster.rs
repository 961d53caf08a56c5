use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use convgate_core::events::JobEvent;
use convgate_core::ids::SessionId;

use crate::session::Session;

/// The set of tracked sessions.
///
/// The lock is held only to copy or mutate the set, never while sending.
/// Once [`close_all`](Self::close_all) has run the registry stays closed and
/// refuses new sessions.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Tracked>,
}

#[derive(Default)]
struct Tracked {
    sessions: Vec<Arc<Session>>,
    closed: bool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `session`. After shutdown began the session is closed instead
    /// and `false` is returned.
    pub fn add(&self, session: Arc<Session>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            session.close();
            return false;
        }
        inner.sessions.push(session);
        true
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.sessions.len();
        inner.sessions.retain(|s| s.id() != id);
        inner.sessions.len() != before
    }

    /// Number of tracked sessions that are still open.
    pub fn count(&self) -> usize {
        self.inner.lock().sessions.iter().filter(|s| s.is_open()).count()
    }

    /// Send `frame` to every open session and return how many accepted it.
    /// Closed sessions found while taking the snapshot are dropped from the
    /// set.
    pub fn broadcast(&self, frame: &str) -> usize {
        let targets: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock();
            inner.sessions.retain(|s| s.is_open());
            inner.sessions.clone()
        };
        targets
            .iter()
            .filter(|s| s.send(frame.to_string()))
            .count()
    }

    pub fn close_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.sessions)
        };
        for session in &sessions {
            session.close();
        }
        sessions.len()
    }
}

/// Drains the job event stream and fans each event out to all sessions.
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn publish(&self, event: &JobEvent) -> usize {
        match event.to_frame() {
            Ok(frame) => {
                let delivered = self.registry.broadcast(&frame);
                tracing::debug!(
                    job_id = %event.job_id,
                    status = %event.status,
                    delivered,
                    "event broadcast"
                );
                delivered
            }
            Err(e) => {
                tracing::error!(job_id = %event.job_id, error = %e, "failed to encode event");
                0
            }
        }
    }

    /// Spawn the fan-out task. It ends when every event sender is dropped.
    pub fn start(self, mut rx: mpsc::UnboundedReceiver<JobEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.publish(&event);
            }
            tracing::info!("event stream closed");
        })
    }
}
