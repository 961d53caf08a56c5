use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::GatewayError;
use crate::ids::JobId;

/// Outbound event type, serialized as the wire `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Error,
    Completed,
}

/// Payload of a `completed` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(rename = "outputPath")]
    pub output_path: String,
}

/// A job lifecycle event as it is sent to every open session.
///
/// Wire shape: `{ type, jobId, progress?, status, message, result? }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(rename = "jobId")]
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_CANCELLED: &str = "cancelled";
pub const STATUS_CANCELLING: &str = "cancelling";
pub const STATUS_NOT_RUNNING: &str = "not_running";
pub const STATUS_IDLE: &str = "idle";

impl JobEvent {
    pub fn progress(
        job_id: JobId,
        progress: u8,
        status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventKind::Progress,
            job_id,
            progress: Some(progress.min(100)),
            status: status.into(),
            message: message.into(),
            result: None,
        }
    }

    pub fn processing(job_id: JobId, progress: u8, message: impl Into<String>) -> Self {
        Self::progress(job_id, progress, STATUS_PROCESSING, message)
    }

    pub fn error(job_id: JobId, error: &GatewayError) -> Self {
        let status = if error.is_cancellation() {
            STATUS_CANCELLED
        } else {
            STATUS_ERROR
        };
        Self::error_with_status(job_id, status, error.to_string())
    }

    pub fn error_message(job_id: JobId, message: impl Into<String>) -> Self {
        Self::error_with_status(job_id, STATUS_ERROR, message)
    }

    /// Terminal event of a job that observed its cancel flag.
    pub fn cancelled(job_id: JobId, message: impl Into<String>) -> Self {
        Self::error_with_status(job_id, STATUS_CANCELLED, message)
    }

    fn error_with_status(job_id: JobId, status: &str, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            job_id,
            progress: None,
            status: status.into(),
            message: message.into(),
            result: None,
        }
    }

    /// Terminal success. `output_path` is `None` for operations that produce
    /// no file, in which case the `result` object is omitted.
    pub fn completed(
        job_id: JobId,
        output_path: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventKind::Completed,
            job_id,
            progress: Some(100),
            status: STATUS_COMPLETED.into(),
            message: message.into(),
            result: output_path.map(|output_path| JobResult { output_path }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Error | EventKind::Completed)
    }

    /// Encode as one text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Sending half of the lifecycle event stream.
///
/// Unbounded so that emitters on the host thread never block on the
/// network domain. A single consumer fans events out to sessions.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: JobEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(job_id = %e.0.job_id, "event bus closed, dropping event");
        }
    }
}
