//! The host's single execution context.
//!
//! `host_channel` splits the context into a [`HostSender`], the
//! [`ExecutionContext`] the bridge submits through, and a [`HostInbox`] the
//! host drains on its own thread. Embedders with their own event loop call
//! [`HostInbox::run_pending`] from it; standalone deployments use
//! [`HostThread::spawn`].

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use convgate_core::errors::{DispatchError, GatewayError, OperationError};
use convgate_core::ids::JobId;

use crate::bridge::{ClaimedCall, ExecutionContext, HostCall};
use crate::coordinator::{JobCleanup, JobOutcome, JobPermit, ProgressReporter, TerminalState};
use crate::engine::{ConversionEngine, ConversionJob, HostOperation, HostRequest};

pub const HOST_THREAD_NAME: &str = "convgate-host";

const CONVERTED_MESSAGE: &str = "Conversion completed successfully";
const LOADED_MESSAGE: &str = "IFC file loaded successfully";

/// Identity of the thread that drains the inbox. Bound on first drain.
#[derive(Clone, Debug, Default)]
pub struct HostAffinity {
    thread: Arc<OnceLock<ThreadId>>,
}

impl HostAffinity {
    /// Bind to the calling thread. Returns false if another thread is
    /// already bound.
    pub fn bind(&self) -> bool {
        let current = thread::current().id();
        *self.thread.get_or_init(|| current) == current
    }

    pub fn is_host_thread(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }
}

pub fn host_channel() -> (HostSender, HostInbox) {
    let (tx, rx) = mpsc::channel();
    let affinity = HostAffinity::default();
    (
        HostSender {
            tx,
            affinity: affinity.clone(),
        },
        HostInbox { rx, affinity },
    )
}

/// Network-side handle to the host context.
#[derive(Clone)]
pub struct HostSender {
    tx: mpsc::Sender<HostCall>,
    affinity: HostAffinity,
}

impl HostSender {
    pub fn affinity(&self) -> HostAffinity {
        self.affinity.clone()
    }
}

impl ExecutionContext for HostSender {
    fn submit(&self, call: HostCall) -> Result<(), DispatchError> {
        self.tx.send(call).map_err(|_| DispatchError::Unreachable)
    }
}

/// Host-side queue of submitted calls.
pub struct HostInbox {
    rx: mpsc::Receiver<HostCall>,
    affinity: HostAffinity,
}

impl HostInbox {
    pub fn affinity(&self) -> HostAffinity {
        self.affinity.clone()
    }

    /// Drain calls until every sender is gone. Blocks the calling thread.
    pub fn run(self, executor: &JobExecutor) {
        if !self.affinity.bind() {
            tracing::error!("host inbox drained from a second thread");
            return;
        }
        tracing::info!(thread = ?thread::current().name(), "host execution context running");
        for call in self.rx.iter() {
            executor.execute(call);
        }
        tracing::info!("host execution context stopped");
    }

    /// Execute every call already queued and return how many were taken.
    pub fn run_pending(&self, executor: &JobExecutor) -> usize {
        if !self.affinity.bind() {
            tracing::error!("host inbox drained from a second thread");
            return 0;
        }
        let mut count = 0;
        for call in self.rx.try_iter() {
            executor.execute(call);
            count += 1;
        }
        count
    }
}

/// Runs claimed calls against the engine and performs the terminal
/// transition.
#[derive(Clone)]
pub struct JobExecutor {
    engine: Arc<dyn ConversionEngine>,
}

impl JobExecutor {
    pub fn new(engine: Arc<dyn ConversionEngine>) -> Self {
        Self { engine }
    }

    pub fn execute(&self, call: HostCall) {
        let job_id = call.request().job_id.clone();
        let Some(ClaimedCall { request, permit }) = call.claim() else {
            tracing::debug!(job_id = %job_id, "skipping call abandoned by dispatcher");
            return;
        };
        tracing::info!(job_id = %job_id, command = request.command_name(), "host executing job");

        let outcome = if permit.is_cancel_requested() {
            JobOutcome::Cancelled
        } else {
            self.run(&request, &permit)
        };
        permit.finish(outcome);
    }

    fn run(&self, request: &HostRequest, permit: &JobPermit) -> JobOutcome {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match &request.operation {
            HostOperation::Convert {
                direction,
                input_path,
                output_path,
            } => {
                let job = ConversionJob {
                    job_id: permit.job_id(),
                    direction: *direction,
                    input_path,
                    output_path,
                    progress: ProgressReporter::new(permit),
                    cancel: permit.cancel_token(),
                };
                self.engine
                    .convert(&job)
                    .map(|()| JobOutcome::completed(Some(output_path.clone()), CONVERTED_MESSAGE))
            }
            HostOperation::Load { input_path } => self
                .engine
                .load(permit.job_id(), input_path)
                .map(|()| JobOutcome::completed(None, LOADED_MESSAGE)),
        }));

        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(OperationError::Cancelled)) => JobOutcome::Cancelled,
            Ok(Err(e)) => JobOutcome::Failed(GatewayError::Operation(e)),
            Err(_) => {
                tracing::error!(job_id = %permit.job_id(), "conversion engine panicked");
                JobOutcome::Failed(GatewayError::Operation(OperationError::Panicked))
            }
        }
    }
}

/// Dedicated host thread for standalone deployments.
pub struct HostThread {
    handle: JoinHandle<()>,
}

impl HostThread {
    pub fn spawn(inbox: HostInbox, executor: JobExecutor) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name(HOST_THREAD_NAME.into())
            .spawn(move || inbox.run(&executor))?;
        Ok(Self { handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread to exit. It exits once every [`HostSender`] is
    /// dropped.
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("host thread panicked");
        }
    }
}

/// Returns the host to a neutral document after every job.
///
/// Only acts on the host thread: a job that failed before the host claimed
/// it never touched the document.
pub struct ResetHostDocument {
    engine: Arc<dyn ConversionEngine>,
    affinity: HostAffinity,
}

impl ResetHostDocument {
    pub fn new(engine: Arc<dyn ConversionEngine>, affinity: HostAffinity) -> Self {
        Self { engine, affinity }
    }
}

impl JobCleanup for ResetHostDocument {
    fn after_job(&self, job_id: &JobId, state: TerminalState) {
        if !self.affinity.is_host_thread() {
            tracing::debug!(job_id = %job_id, ?state, "job ended off the host thread, no reset");
            return;
        }
        match self.engine.reset_document() {
            Ok(()) => tracing::debug!(job_id = %job_id, ?state, "host document reset"),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "host document reset failed"),
        }
    }
}
