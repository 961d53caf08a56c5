//! Hand-off of admitted jobs to the host execution context.
//!
//! The round trip is an acceptance handshake: the bridge submits a
//! [`HostCall`] and waits, bounded by a timeout, for the host to claim it.
//! The call and the bridge share the job's [`JobPermit`] through one slot;
//! whoever takes the permit first owns the terminal transition. A host that
//! claims late finds the slot empty and skips the job, so a timed-out job is
//! never run behind the caller's back.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use convgate_core::errors::DispatchError;
use convgate_core::ids::JobId;

use crate::coordinator::{JobOutcome, JobPermit};
use crate::engine::HostRequest;

/// Acknowledgement sent by the host when it claims a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostAck {
    /// Name of the thread that claimed the call.
    pub thread: Option<String>,
}

impl HostAck {
    fn current_thread() -> Self {
        Self {
            thread: std::thread::current().name().map(str::to_string),
        }
    }
}

type PermitSlot = Arc<Mutex<Option<JobPermit>>>;

/// One dispatched job, in flight to the host.
pub struct HostCall {
    request: HostRequest,
    permit: PermitSlot,
    ack: Option<oneshot::Sender<HostAck>>,
}

impl std::fmt::Debug for HostCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCall").field("request", &self.request).finish()
    }
}

/// A call the host has taken ownership of.
#[derive(Debug)]
pub struct ClaimedCall {
    pub request: HostRequest,
    pub permit: JobPermit,
}

impl HostCall {
    pub fn request(&self) -> &HostRequest {
        &self.request
    }

    /// Take ownership of the job on the calling thread. Returns `None` when
    /// the bridge already gave up on this call.
    pub fn claim(mut self) -> Option<ClaimedCall> {
        let permit = {
            let mut slot = self.permit.lock();
            let permit = slot.take()?;
            if let Some(ack) = self.ack.take() {
                let _ = ack.send(HostAck::current_thread());
            }
            permit
        };
        Some(ClaimedCall {
            request: self.request,
            permit,
        })
    }
}

/// The host's single designated execution context, as seen from the
/// network domain. `submit` must not block.
pub trait ExecutionContext: Send + Sync {
    fn submit(&self, call: HostCall) -> Result<(), DispatchError>;
}

/// Bounded hand-off of admitted jobs to an [`ExecutionContext`].
#[derive(Clone)]
pub struct DispatchBridge {
    context: Arc<dyn ExecutionContext>,
    timeout: Duration,
}

impl DispatchBridge {
    pub fn new(context: Arc<dyn ExecutionContext>, timeout: Duration) -> Self {
        Self { context, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Submit `request` and wait for the host to claim it.
    ///
    /// On any failure the permit is finished here with the
    /// [`DispatchError`], which emits the job's single error event and
    /// returns the coordinator to Idle. The error is also returned for
    /// logging; callers have nothing further to clean up.
    pub async fn dispatch(
        &self,
        request: HostRequest,
        permit: JobPermit,
    ) -> Result<HostAck, DispatchError> {
        let job_id = request.job_id.clone();
        let command = request.command_name();
        let slot: PermitSlot = Arc::new(Mutex::new(Some(permit)));
        let (ack_tx, mut ack_rx) = oneshot::channel();

        let call = HostCall {
            request,
            permit: Arc::clone(&slot),
            ack: Some(ack_tx),
        };
        tracing::debug!(job_id = %job_id, command, "dispatching to host");

        if let Err(e) = self.context.submit(call) {
            return Err(fail(&job_id, &slot, e));
        }

        match tokio::time::timeout(self.timeout, &mut ack_rx).await {
            Ok(Ok(ack)) => {
                tracing::debug!(job_id = %job_id, thread = ?ack.thread, "host claimed job");
                Ok(ack)
            }
            Ok(Err(_)) => Err(fail(&job_id, &slot, DispatchError::Unreachable)),
            Err(_) => {
                // Claim takes the permit and acks under the slot lock, so
                // either the ack is already here or the permit is still ours.
                let permit = {
                    let mut guard = slot.lock();
                    if let Ok(ack) = ack_rx.try_recv() {
                        return Ok(ack);
                    }
                    guard.take()
                };
                let err = DispatchError::Timeout(self.timeout);
                if let Some(permit) = permit {
                    finish_failed(&job_id, permit, &err);
                }
                Err(err)
            }
        }
    }
}

fn fail(job_id: &JobId, slot: &PermitSlot, err: DispatchError) -> DispatchError {
    let permit = slot.lock().take();
    if let Some(permit) = permit {
        finish_failed(job_id, permit, &err);
    }
    err
}

fn finish_failed(job_id: &JobId, permit: JobPermit, err: &DispatchError) {
    tracing::warn!(job_id = %job_id, error = %err, "dispatch to host failed");
    permit.finish(JobOutcome::Failed(err.clone().into()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{JobCoordinator, NoopCleanup};
    use convgate_core::command::Direction;
    use convgate_core::events::{EventBus, EventKind, JobEvent};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Context whose thread is gone: every call is dropped unclaimed.
    struct DroppingContext;

    impl ExecutionContext for DroppingContext {
        fn submit(&self, call: HostCall) -> Result<(), DispatchError> {
            drop(call);
            Ok(())
        }
    }

    struct RejectingContext;

    impl ExecutionContext for RejectingContext {
        fn submit(&self, _call: HostCall) -> Result<(), DispatchError> {
            Err(DispatchError::Rejected("host busy with modal dialog".into()))
        }
    }

    /// Context that queues calls and never claims them on its own.
    #[derive(Default)]
    struct StallingContext {
        calls: Mutex<Vec<HostCall>>,
    }

    impl ExecutionContext for StallingContext {
        fn submit(&self, call: HostCall) -> Result<(), DispatchError> {
            self.calls.lock().push(call);
            Ok(())
        }
    }

    /// Context that claims and completes inline.
    struct InlineContext;

    impl ExecutionContext for InlineContext {
        fn submit(&self, call: HostCall) -> Result<(), DispatchError> {
            if let Some(claimed) = call.claim() {
                claimed
                    .permit
                    .finish(JobOutcome::completed(None, "done inline"));
            }
            Ok(())
        }
    }

    fn setup() -> (JobCoordinator, UnboundedReceiver<JobEvent>) {
        let (bus, rx) = EventBus::channel();
        (JobCoordinator::new(Arc::new(NoopCleanup), bus), rx)
    }

    fn request(id: &str) -> HostRequest {
        HostRequest::convert(JobId::from_raw(id), Direction::PlnToIfc, "/in.pln", "/out.ifc")
    }

    fn drain(rx: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn unreachable_context_fails_job_once() {
        let (coord, mut rx) = setup();
        let bridge = DispatchBridge::new(Arc::new(DroppingContext), Duration::from_secs(5));
        let permit = coord.try_admit(JobId::from_raw("J1")).unwrap();

        let err = bridge.dispatch(request("J1"), permit).await.unwrap_err();
        assert_eq!(err, DispatchError::Unreachable);
        assert!(coord.is_idle());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Error);
        assert_eq!(events[0].job_id, "J1");
    }

    #[tokio::test]
    async fn rejected_submit_fails_job_once() {
        let (coord, mut rx) = setup();
        let bridge = DispatchBridge::new(Arc::new(RejectingContext), Duration::from_secs(5));
        let permit = coord.try_admit(JobId::from_raw("J1")).unwrap();

        let err = bridge.dispatch(request("J1"), permit).await.unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(_)));
        assert!(coord.is_idle());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].message.contains("modal dialog"));
    }

    #[tokio::test]
    async fn timeout_fails_job_and_late_claim_is_skipped() {
        let (coord, mut rx) = setup();
        let ctx = Arc::new(StallingContext::default());
        let bridge = DispatchBridge::new(ctx.clone(), Duration::from_millis(30));
        let permit = coord.try_admit(JobId::from_raw("J1")).unwrap();

        let err = bridge.dispatch(request("J1"), permit).await.unwrap_err();
        assert_eq!(err, DispatchError::Timeout(Duration::from_millis(30)));
        assert!(coord.is_idle());
        assert_eq!(drain(&mut rx).len(), 1);

        let late = ctx.calls.lock().pop().unwrap();
        assert_eq!(late.request().job_id, "J1");
        assert!(late.claim().is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn claimed_call_returns_ack() {
        let (coord, mut rx) = setup();
        let bridge = DispatchBridge::new(Arc::new(InlineContext), Duration::from_secs(5));
        let permit = coord.try_admit(JobId::from_raw("J1")).unwrap();

        bridge.dispatch(request("J1"), permit).await.unwrap();
        assert!(coord.is_idle());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Completed);
    }

    #[tokio::test]
    async fn claim_from_another_thread_is_acknowledged() {
        let (coord, _rx) = setup();
        let ctx = Arc::new(StallingContext::default());
        let bridge = DispatchBridge::new(ctx.clone(), Duration::from_secs(5));
        let permit = coord.try_admit(JobId::from_raw("J1")).unwrap();

        let ctx2 = ctx.clone();
        let worker = std::thread::Builder::new()
            .name("claimer".into())
            .spawn(move || loop {
                if let Some(call) = ctx2.calls.lock().pop() {
                    return call.claim();
                }
                std::thread::sleep(Duration::from_millis(2));
            })
            .unwrap();

        let ack = bridge.dispatch(request("J1"), permit).await.unwrap();
        assert_eq!(ack.thread.as_deref(), Some("claimer"));

        let claimed = worker.join().unwrap().unwrap();
        assert!(!coord.is_idle());
        claimed.permit.finish(JobOutcome::Cancelled);
        assert!(coord.is_idle());
    }
}
