//! Job coordination and host-side execution.
//!
//! The [`JobCoordinator`] enforces single-flight admission and owns the job
//! lifecycle. Admitted jobs travel to the host's one execution thread
//! through the [`DispatchBridge`], where a [`JobExecutor`] runs them against
//! a [`ConversionEngine`].

pub mod bridge;
pub mod coordinator;
pub mod engine;
pub mod host;
pub mod simulated;

pub use bridge::{ClaimedCall, DispatchBridge, ExecutionContext, HostAck, HostCall};
pub use coordinator::{
    JobCleanup, JobCoordinator, JobOutcome, JobPermit, JobSnapshot, JobState, NoopCleanup,
    ProgressReporter, TerminalState,
};
pub use engine::{ConversionEngine, ConversionJob, HostOperation, HostRequest, HOST_NAMESPACE};
pub use host::{
    host_channel, HostAffinity, HostInbox, HostSender, HostThread, JobExecutor, ResetHostDocument,
    HOST_THREAD_NAME,
};
pub use simulated::SimulatedEngine;
