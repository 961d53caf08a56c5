//! Single-flight job coordination.
//!
//! The `JobCoordinator` owns the one job slot shared by the network domain
//! (admission, cancel, status) and the host execution domain (progress,
//! terminal transition). All fields live behind one mutex so that both
//! sides observe the same state; admitting a job and seeing it Running are
//! ordered by that lock.
//!
//! State machine: `Idle -> Running -> Terminal(..) -> Idle`. Admission hands
//! out a [`JobPermit`]; finishing (or dropping) the permit is the only way
//! back to `Idle`, and it always runs the registered [`JobCleanup`] first.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use convgate_core::errors::{GatewayError, OperationError};
use convgate_core::events::{EventBus, JobEvent};
use convgate_core::ids::JobId;

/// How a job left the Running state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Terminal(TerminalState),
}

/// Result handed to [`JobPermit::finish`].
#[derive(Clone, Debug)]
pub enum JobOutcome {
    Completed {
        output_path: Option<String>,
        message: String,
    },
    Failed(GatewayError),
    Cancelled,
}

impl JobOutcome {
    pub fn completed(output_path: Option<String>, message: impl Into<String>) -> Self {
        Self::Completed {
            output_path,
            message: message.into(),
        }
    }

    pub fn terminal_state(&self) -> TerminalState {
        match self {
            Self::Completed { .. } => TerminalState::Completed,
            Self::Failed(e) if e.is_cancellation() => TerminalState::Cancelled,
            Self::Failed(_) => TerminalState::Failed,
            Self::Cancelled => TerminalState::Cancelled,
        }
    }

    fn into_event(self, job_id: JobId) -> JobEvent {
        match self {
            Self::Completed {
                output_path,
                message,
            } => JobEvent::completed(job_id, output_path, message),
            Self::Failed(e) if e.is_cancellation() => {
                JobEvent::cancelled(job_id, "Conversion cancelled")
            }
            Self::Failed(e) => JobEvent::error(job_id, &e),
            Self::Cancelled => JobEvent::cancelled(job_id, "Conversion cancelled"),
        }
    }
}

/// Compensating step run on every `Running -> Terminal` transition,
/// whatever the outcome.
pub trait JobCleanup: Send + Sync {
    fn after_job(&self, job_id: &JobId, state: TerminalState);
}

/// Cleanup that only records the transition.
pub struct NoopCleanup;

impl JobCleanup for NoopCleanup {
    fn after_job(&self, job_id: &JobId, state: TerminalState) {
        tracing::debug!(job_id = %job_id, ?state, "job cleanup (noop)");
    }
}

/// Point-in-time view of the job slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub state: JobState,
    pub job_id: Option<JobId>,
    pub progress: u8,
    pub message: String,
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    /// Whether `job_id` is the job currently Running.
    pub fn is_running(&self, job_id: &JobId) -> bool {
        self.state == JobState::Running && self.job_id.as_ref() == Some(job_id)
    }
}

struct Slot {
    state: JobState,
    job_id: Option<JobId>,
    progress: u8,
    message: String,
    cancel: Option<CancellationToken>,
    started_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn idle() -> Self {
        Self {
            state: JobState::Idle,
            job_id: None,
            progress: 0,
            message: String::new(),
            cancel: None,
            started_at: None,
        }
    }
}

struct Inner {
    slot: Mutex<Slot>,
    cleanup: Arc<dyn JobCleanup>,
    events: EventBus,
}

/// Owner of the single job slot. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

impl JobCoordinator {
    pub fn new(cleanup: Arc<dyn JobCleanup>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::idle()),
                cleanup,
                events,
            }),
        }
    }

    /// The single-flight admission gate. Exactly one concurrent caller can
    /// succeed; the rest get [`GatewayError::Busy`] naming the active job.
    pub fn try_admit(&self, job_id: JobId) -> Result<JobPermit, GatewayError> {
        if job_id.is_empty() {
            return Err(GatewayError::protocol("missing jobId"));
        }

        let cancel = CancellationToken::new();
        {
            let mut slot = self.inner.slot.lock();
            if slot.state != JobState::Idle {
                return Err(GatewayError::Busy {
                    active: slot.job_id.clone().unwrap_or_default(),
                });
            }
            *slot = Slot {
                state: JobState::Running,
                job_id: Some(job_id.clone()),
                progress: 0,
                message: "Queued".into(),
                cancel: Some(cancel.clone()),
                started_at: Some(Utc::now()),
            };
        }

        tracing::info!(job_id = %job_id, "job admitted");
        Ok(JobPermit {
            inner: Arc::clone(&self.inner),
            job_id,
            cancel,
            admitted_at: Instant::now(),
            finished: false,
        })
    }

    /// Request cooperative cancellation of `job_id`. Returns false unless
    /// that exact job is currently Running.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        let slot = self.inner.slot.lock();
        if slot.state != JobState::Running || slot.job_id.as_ref() != Some(job_id) {
            return false;
        }
        if let Some(cancel) = &slot.cancel {
            cancel.cancel();
        }
        tracing::info!(job_id = %job_id, "cancellation requested");
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let slot = self.inner.slot.lock();
        JobSnapshot {
            state: slot.state,
            job_id: slot.job_id.clone(),
            progress: slot.progress,
            message: slot.message.clone(),
            cancel_requested: slot.cancel.as_ref().is_some_and(|c| c.is_cancelled()),
            started_at: slot.started_at,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.inner.slot.lock().state == JobState::Idle
    }
}

/// Proof of admission for one job.
///
/// Travels with the job to wherever it executes. Consuming it with
/// [`finish`](Self::finish) performs the terminal transition; dropping it
/// unfinished does the same with a failure outcome, so the slot can never be
/// leaked in the Running state by an early return or a panic.
pub struct JobPermit {
    inner: Arc<Inner>,
    job_id: JobId,
    cancel: CancellationToken,
    admitted_at: Instant,
    finished: bool,
}

impl std::fmt::Debug for JobPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPermit")
            .field("job_id", &self.job_id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl JobPermit {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record progress and broadcast it. Values above 100 are clamped;
    /// values below the last reported progress are ignored.
    pub fn report_progress(&self, percent: u8, message: &str) -> bool {
        let percent = percent.min(100);
        {
            let mut slot = self.inner.slot.lock();
            if slot.state != JobState::Running || slot.job_id.as_ref() != Some(&self.job_id) {
                return false;
            }
            if percent < slot.progress {
                tracing::debug!(
                    job_id = %self.job_id,
                    percent,
                    last = slot.progress,
                    "ignoring decreasing progress"
                );
                return false;
            }
            slot.progress = percent;
            slot.message = message.to_string();
        }
        self.inner
            .events
            .emit(JobEvent::processing(self.job_id.clone(), percent, message));
        true
    }

    /// Terminal transition: cleanup, reset to Idle, then one terminal event.
    pub fn finish(mut self, outcome: JobOutcome) {
        self.complete(outcome);
    }

    fn complete(&mut self, outcome: JobOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;

        let state = outcome.terminal_state();
        self.inner.slot.lock().state = JobState::Terminal(state);

        let cleanup = Arc::clone(&self.inner.cleanup);
        let job_id = &self.job_id;
        if panic::catch_unwind(AssertUnwindSafe(|| cleanup.after_job(job_id, state))).is_err() {
            tracing::error!(job_id = %self.job_id, "job cleanup panicked");
        }

        *self.inner.slot.lock() = Slot::idle();

        let elapsed_ms = self.admitted_at.elapsed().as_millis() as u64;
        match &outcome {
            JobOutcome::Failed(e) => tracing::warn!(
                job_id = %self.job_id,
                ?state,
                elapsed_ms,
                error = %e,
                kind = e.error_kind(),
                "job finished"
            ),
            _ => tracing::info!(job_id = %self.job_id, ?state, elapsed_ms, "job finished"),
        }

        self.inner.events.emit(outcome.into_event(self.job_id.clone()));
    }
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        if !self.finished {
            self.complete(JobOutcome::Failed(GatewayError::Operation(
                OperationError::Failed("job abandoned before completion".into()),
            )));
        }
    }
}

/// Progress callback handed to the conversion engine.
pub struct ProgressReporter<'a> {
    permit: &'a JobPermit,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(permit: &'a JobPermit) -> Self {
        Self { permit }
    }

    pub fn report(&self, percent: u8, message: &str) {
        self.permit.report_progress(percent, message);
    }
}
