//! Decodes inbound frames and routes them to the job coordinator.
//!
//! Routing is synchronous: admission happens before `on_frame` returns, so
//! two frames on the same session are admitted in arrival order. The host
//! round trip runs on a spawned task, which keeps the reader free to answer
//! `get_status` and `cancel_job` while a job is being dispatched.

use std::sync::Arc;

use convgate_core::command::{CommandEnvelope, CommandKind, KEY_COMPILED_PATH};
use convgate_core::errors::GatewayError;
use convgate_core::escape::preview;
use convgate_core::events::{
    EventBus, JobEvent, STATUS_CANCELLING, STATUS_IDLE, STATUS_NOT_RUNNING, STATUS_PROCESSING,
};
use convgate_core::ids::JobId;
use convgate_host::{DispatchBridge, HostRequest, JobCoordinator};

use crate::session::{FrameHandler, Session};

const PREVIEW_CHARS: usize = 200;

const MISSING_JOB_ID: &str = "Missing jobId";
const MISSING_PATHS: &str = "Missing input path (pln_path or ifc_path) and output_path";
const MISSING_IFC_PATH: &str = "Missing ifcPath parameter";
const READY_MESSAGE: &str = "Gateway ready";
const CANCELLING_MESSAGE: &str = "Cancellation requested";
const NOT_RUNNING_MESSAGE: &str = "No running job with this id";

/// What the router did with one frame.
#[derive(Clone, Debug)]
pub enum RouteOutcome {
    /// Malformed or unrecognized frame; dropped without an event.
    Dropped(GatewayError),
    /// Answered with an error event; nothing was admitted.
    Rejected(GatewayError),
    /// Admitted and handed to the dispatch bridge.
    Dispatched(JobId),
    /// Cancel request answered; `accepted` mirrors the coordinator's reply.
    Cancel { job_id: JobId, accepted: bool },
    /// Status answered; `running` is true when the job was Running.
    Status { job_id: JobId, running: bool },
}

pub struct CommandRouter {
    coordinator: JobCoordinator,
    bridge: DispatchBridge,
    events: EventBus,
}

impl CommandRouter {
    pub fn new(coordinator: JobCoordinator, bridge: DispatchBridge, events: EventBus) -> Self {
        Self {
            coordinator,
            bridge,
            events,
        }
    }

    /// Route one raw frame. Must be called from within a Tokio runtime.
    pub fn route(&self, raw: &str) -> RouteOutcome {
        let envelope = match CommandEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => return RouteOutcome::Dropped(e),
        };
        let Some(kind) = envelope.kind() else {
            return RouteOutcome::Dropped(GatewayError::protocol(format!(
                "unknown command '{}'",
                envelope.command
            )));
        };

        match kind {
            CommandKind::StartConversion => self.start_conversion(&envelope),
            CommandKind::LoadIfc => self.load_ifc(&envelope),
            CommandKind::CancelJob => self.cancel_job(envelope.job_id),
            CommandKind::GetStatus => self.get_status(envelope.job_id),
        }
    }

    fn start_conversion(&self, envelope: &CommandEnvelope) -> RouteOutcome {
        if envelope.job_id.is_empty() {
            return self.reject(JobId::default(), MISSING_JOB_ID);
        }
        let direction = envelope.direction();
        let output = envelope.output_path();
        let (Some(direction), false) = (direction, output.is_empty()) else {
            return self.reject(envelope.job_id.clone(), MISSING_PATHS);
        };

        let input = envelope.field(direction.input_key());
        let request = HostRequest::convert(envelope.job_id.clone(), direction, input, output);
        self.admit(request)
    }

    fn load_ifc(&self, envelope: &CommandEnvelope) -> RouteOutcome {
        if envelope.job_id.is_empty() {
            return self.reject(JobId::default(), MISSING_JOB_ID);
        }
        let input = envelope.field(KEY_COMPILED_PATH);
        if input.is_empty() {
            return self.reject(envelope.job_id.clone(), MISSING_IFC_PATH);
        }
        self.admit(HostRequest::load(envelope.job_id.clone(), input))
    }

    fn admit(&self, request: HostRequest) -> RouteOutcome {
        let job_id = request.job_id.clone();
        let permit = match self.coordinator.try_admit(job_id.clone()) {
            Ok(permit) => permit,
            Err(e) => {
                tracing::info!(job_id = %job_id, error = %e, "job rejected");
                self.events.emit(JobEvent::error(job_id, &e));
                return RouteOutcome::Rejected(e);
            }
        };

        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            // Failures are already reported to clients by the bridge.
            let _ = bridge.dispatch(request, permit).await;
        });
        RouteOutcome::Dispatched(job_id)
    }

    fn cancel_job(&self, job_id: JobId) -> RouteOutcome {
        let accepted = self.coordinator.cancel(&job_id);
        let progress = self.coordinator.snapshot().progress;
        let event = if accepted {
            JobEvent::progress(job_id.clone(), progress, STATUS_CANCELLING, CANCELLING_MESSAGE)
        } else {
            JobEvent::progress(job_id.clone(), 0, STATUS_NOT_RUNNING, NOT_RUNNING_MESSAGE)
        };
        self.events.emit(event);
        RouteOutcome::Cancel { job_id, accepted }
    }

    fn get_status(&self, job_id: JobId) -> RouteOutcome {
        let snapshot = self.coordinator.snapshot();
        let running = snapshot.is_running(&job_id);
        let event = if running {
            JobEvent::progress(
                job_id.clone(),
                snapshot.progress,
                STATUS_PROCESSING,
                snapshot.message,
            )
        } else {
            JobEvent::progress(job_id.clone(), 0, STATUS_IDLE, READY_MESSAGE)
        };
        self.events.emit(event);
        RouteOutcome::Status { job_id, running }
    }

    fn reject(&self, job_id: JobId, message: &str) -> RouteOutcome {
        tracing::info!(job_id = %job_id, reason = message, "command rejected");
        self.events.emit(JobEvent::error_message(job_id, message));
        RouteOutcome::Rejected(GatewayError::protocol(message))
    }
}

impl FrameHandler for CommandRouter {
    fn on_frame(&self, session: &Arc<Session>, frame: &str) {
        match self.route(frame) {
            RouteOutcome::Dropped(e) => tracing::warn!(
                session_id = %session.id(),
                error = %e,
                frame = %preview(frame, PREVIEW_CHARS),
                "dropping frame"
            ),
            outcome => tracing::debug!(session_id = %session.id(), ?outcome, "frame routed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use convgate_core::errors::DispatchError;
    use convgate_core::events::{EventKind, STATUS_ERROR};
    use convgate_host::{
        ClaimedCall, ExecutionContext, HostCall, HostOperation, JobOutcome, NoopCleanup,
    };
    use parking_lot::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Host stand-in that parks calls until the test claims them.
    #[derive(Default)]
    struct ParkedContext {
        calls: Mutex<Vec<HostCall>>,
    }

    impl ParkedContext {
        async fn next_call(&self) -> HostCall {
            for _ in 0..500 {
                if let Some(call) = self.calls.lock().pop() {
                    return call;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            panic!("no call dispatched");
        }
    }

    impl ExecutionContext for ParkedContext {
        fn submit(&self, call: HostCall) -> Result<(), DispatchError> {
            self.calls.lock().push(call);
            Ok(())
        }
    }

    struct Fixture {
        router: CommandRouter,
        coordinator: JobCoordinator,
        host: Arc<ParkedContext>,
        events: UnboundedReceiver<JobEvent>,
    }

    fn fixture() -> Fixture {
        let (bus, events) = EventBus::channel();
        let coordinator = JobCoordinator::new(Arc::new(NoopCleanup), bus.clone());
        let host = Arc::new(ParkedContext::default());
        let bridge = DispatchBridge::new(host.clone(), Duration::from_secs(5));
        Fixture {
            router: CommandRouter::new(coordinator.clone(), bridge, bus),
            coordinator,
            host,
            events,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    const START_J1: &str =
        r#"{"command":"start_conversion","jobId":"J1","plnPath":"/a.pln","outputPath":"/a.ifc"}"#;

    #[tokio::test]
    async fn frame_without_command_is_dropped_silently() {
        let mut f = fixture();
        let outcome = f.router.route(r#"{"jobId":"J1","plnPath":"/a.pln"}"#);
        assert!(matches!(outcome, RouteOutcome::Dropped(_)));
        assert!(drain(&mut f.events).is_empty());
        assert!(f.coordinator.is_idle());

        // The next frame is still routed normally.
        assert!(matches!(
            f.router.route(r#"{"command":"get_status","jobId":"J1"}"#),
            RouteOutcome::Status { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_command_and_garbage_are_dropped() {
        let mut f = fixture();
        assert!(matches!(
            f.router.route(r#"{"command":"format_disk"}"#),
            RouteOutcome::Dropped(_)
        ));
        assert!(matches!(f.router.route("not json"), RouteOutcome::Dropped(_)));
        assert!(drain(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn start_without_paths_is_rejected_with_error_event() {
        let mut f = fixture();
        let outcome = f
            .router
            .route(r#"{"command":"start_conversion","jobId":"J1","plnPath":"/a.pln"}"#);
        assert!(matches!(outcome, RouteOutcome::Rejected(_)));
        let events = drain(&mut f.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Error);
        assert_eq!(events[0].job_id, "J1");
        assert_eq!(events[0].message, MISSING_PATHS);
        assert!(f.coordinator.is_idle());
    }

    #[tokio::test]
    async fn start_without_job_id_reports_empty_id() {
        let mut f = fixture();
        f.router
            .route(r#"{"command":"start_conversion","plnPath":"/a.pln","outputPath":"/a.ifc"}"#);
        let events = drain(&mut f.events);
        assert_eq!(events.len(), 1);
        assert!(events[0].job_id.is_empty());
        assert_eq!(events[0].message, MISSING_JOB_ID);
    }

    #[tokio::test]
    async fn second_start_is_busy_and_first_is_unaffected() {
        let mut f = fixture();
        assert!(matches!(f.router.route(START_J1), RouteOutcome::Dispatched(_)));

        let outcome = f.router.route(
            r#"{"command":"start_conversion","jobId":"J2","ifcPath":"/b.ifc","outputPath":"/b.pln"}"#,
        );
        assert!(matches!(
            outcome,
            RouteOutcome::Rejected(GatewayError::Busy { .. })
        ));

        let events = drain(&mut f.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job_id, "J2");
        assert_eq!(events[0].status, STATUS_ERROR);
        assert!(events[0].message.contains("already in progress"));

        let call = f.host.next_call().await;
        let ClaimedCall { request, permit } = call.claim().unwrap();
        assert_eq!(request.job_id, "J1");
        assert_eq!(
            request.operation,
            HostOperation::Convert {
                direction: convgate_core::command::Direction::PlnToIfc,
                input_path: "/a.pln".into(),
                output_path: "/a.ifc".into(),
            }
        );
        permit.finish(JobOutcome::completed(Some("/a.ifc".into()), "done"));
        assert!(f.coordinator.is_idle());
    }

    #[tokio::test]
    async fn status_and_cancel_are_answered_while_running() {
        let mut f = fixture();
        f.router.route(START_J1);
        let ClaimedCall { permit, .. } = f.host.next_call().await.claim().unwrap();
        permit.report_progress(30, "Opening .pln project");
        drain(&mut f.events);

        let outcome = f.router.route(r#"{"command":"get_status","jobId":"J1"}"#);
        assert!(matches!(outcome, RouteOutcome::Status { running: true, .. }));
        let status = drain(&mut f.events).pop().unwrap();
        assert_eq!(status.status, STATUS_PROCESSING);
        assert_eq!(status.progress, Some(30));
        assert_eq!(status.message, "Opening .pln project");

        let outcome = f.router.route(r#"{"command":"get_status","jobId":"other"}"#);
        assert!(matches!(outcome, RouteOutcome::Status { running: false, .. }));
        let status = drain(&mut f.events).pop().unwrap();
        assert_eq!(status.status, STATUS_IDLE);
        assert_eq!(status.message, READY_MESSAGE);

        let outcome = f.router.route(r#"{"command":"cancel_job","jobId":"J1"}"#);
        assert!(matches!(outcome, RouteOutcome::Cancel { accepted: true, .. }));
        assert!(permit.is_cancel_requested());
        assert_eq!(drain(&mut f.events).pop().unwrap().status, STATUS_CANCELLING);

        permit.finish(JobOutcome::Cancelled);
        drain(&mut f.events);

        let outcome = f.router.route(r#"{"command":"cancel_job","job_id":"J1"}"#);
        assert!(matches!(outcome, RouteOutcome::Cancel { accepted: false, .. }));
        assert_eq!(drain(&mut f.events).pop().unwrap().status, STATUS_NOT_RUNNING);
    }

    #[tokio::test]
    async fn load_ifc_requires_path_and_uses_the_gate() {
        let mut f = fixture();
        f.router.route(r#"{"command":"load_ifc","jobId":"L1"}"#);
        let events = drain(&mut f.events);
        assert_eq!(events[0].message, MISSING_IFC_PATH);

        let outcome = f
            .router
            .route(r#"{"command":"load_ifc","jobId":"L1","ifc_path":"/m.ifc"}"#);
        assert!(matches!(outcome, RouteOutcome::Dispatched(_)));
        assert!(matches!(
            f.router.route(START_J1),
            RouteOutcome::Rejected(GatewayError::Busy { .. })
        ));

        let ClaimedCall { request, permit } = f.host.next_call().await.claim().unwrap();
        assert_eq!(request.command_name(), "LoadIfc");
        permit.finish(JobOutcome::completed(None, "loaded"));
    }
}
