//! The conversion engine seam and the requests that reach it.

use std::fmt;

use tokio_util::sync::CancellationToken;

use convgate_core::command::Direction;
use convgate_core::errors::OperationError;
use convgate_core::ids::JobId;

use crate::coordinator::ProgressReporter;

/// Namespace the host registers its conversion commands under.
pub const HOST_NAMESPACE: &str = "IFCPlugin";

/// What the host is asked to do for one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostOperation {
    Convert {
        direction: Direction,
        input_path: String,
        output_path: String,
    },
    Load {
        input_path: String,
    },
}

/// A job addressed to the host execution context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRequest {
    pub job_id: JobId,
    pub operation: HostOperation,
}

impl HostRequest {
    pub fn convert(
        job_id: JobId,
        direction: Direction,
        input_path: impl Into<String>,
        output_path: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            operation: HostOperation::Convert {
                direction,
                input_path: input_path.into(),
                output_path: output_path.into(),
            },
        }
    }

    pub fn load(job_id: JobId, input_path: impl Into<String>) -> Self {
        Self {
            job_id,
            operation: HostOperation::Load {
                input_path: input_path.into(),
            },
        }
    }

    /// Host-side command name, qualified by [`HOST_NAMESPACE`].
    pub fn command_name(&self) -> &'static str {
        match &self.operation {
            HostOperation::Convert {
                direction: Direction::PlnToIfc,
                ..
            } => "ConvertPlnToIfc",
            HostOperation::Convert {
                direction: Direction::IfcToPln,
                ..
            } => "ConvertIfcToPln",
            HostOperation::Load { .. } => "LoadIfc",
        }
    }
}

impl fmt::Display for HostRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} [{}]", HOST_NAMESPACE, self.command_name(), self.job_id)
    }
}

/// Everything an engine sees while converting one job.
pub struct ConversionJob<'a> {
    pub job_id: &'a JobId,
    pub direction: Direction,
    pub input_path: &'a str,
    pub output_path: &'a str,
    pub progress: ProgressReporter<'a>,
    pub cancel: &'a CancellationToken,
}

impl ConversionJob<'_> {
    /// Checkpoint helper for engines: fails with `Cancelled` once the cancel
    /// flag is set.
    pub fn checkpoint(&self) -> Result<(), OperationError> {
        if self.cancel.is_cancelled() {
            Err(OperationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The opaque conversion algorithm. Always invoked on the host execution
/// context, one job at a time.
pub trait ConversionEngine: Send + Sync {
    fn convert(&self, job: &ConversionJob<'_>) -> Result<(), OperationError>;

    fn load(&self, job_id: &JobId, input_path: &str) -> Result<(), OperationError> {
        let _ = (job_id, input_path);
        Err(OperationError::Unsupported("load"))
    }

    /// Return the host to a neutral document. Run after every job.
    fn reset_document(&self) -> Result<(), OperationError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_follow_direction() {
        let j = JobId::from_raw("J1");
        assert_eq!(
            HostRequest::convert(j.clone(), Direction::PlnToIfc, "a", "b").command_name(),
            "ConvertPlnToIfc"
        );
        assert_eq!(
            HostRequest::convert(j.clone(), Direction::IfcToPln, "a", "b").command_name(),
            "ConvertIfcToPln"
        );
        assert_eq!(HostRequest::load(j, "a").command_name(), "LoadIfc");
    }

    #[test]
    fn display_is_namespaced() {
        let req = HostRequest::load(JobId::from_raw("L1"), "/m.ifc");
        assert_eq!(req.to_string(), "IFCPlugin.LoadIfc [L1]");
    }

    struct ConvertOnly;

    impl ConversionEngine for ConvertOnly {
        fn convert(&self, _job: &ConversionJob<'_>) -> Result<(), OperationError> {
            Ok(())
        }
    }

    #[test]
    fn load_is_unsupported_by_default() {
        let err = ConvertOnly.load(&JobId::from_raw("L1"), "/m.ifc").unwrap_err();
        assert_eq!(err, OperationError::Unsupported("load"));
        assert!(ConvertOnly.reset_document().is_ok());
    }
}
