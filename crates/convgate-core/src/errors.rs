use std::time::Duration;

use crate::ids::JobId;

/// Failure of the hand-off to the host execution context.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("host execution context unreachable")]
    Unreachable,
    #[error("host did not accept the job within {0:?}")]
    Timeout(Duration),
    #[error("host rejected the job: {0}")]
    Rejected(String),
}

/// Failure reported by the conversion engine.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
    #[error("operation not supported by engine: {0}")]
    Unsupported(&'static str),
    #[error("conversion engine panicked")]
    Panicked,
}

/// Every fault the gateway can observe, classified by where it is owned.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed or unrecognized envelope. The frame is dropped, the
    /// connection stays open.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A start request arrived while another job is running.
    #[error("Another conversion is already in progress (active job: {active})")]
    Busy { active: JobId },

    /// Accept/read/write/bind failure, scoped to the owning session or listener.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("conversion failed: {0}")]
    Operation(#[from] OperationError),
}

impl GatewayError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::Busy { .. } => "busy",
            Self::Transport(_) => "transport",
            Self::Dispatch(_) => "dispatch",
            Self::Operation(OperationError::Cancelled) => "cancelled",
            Self::Operation(_) => "operation",
        }
    }

    /// Whether the error ends the job it is attributed to as cancelled
    /// rather than failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Operation(OperationError::Cancelled))
    }
}
