//! Stand-in engine for running the gateway without a host application.
//!
//! Walks through the same stages a real host conversion reports, honours
//! cancellation between and during stages, and produces the output by
//! copying the input file.

use std::path::Path;
use std::time::{Duration, Instant};

use convgate_core::command::Direction;
use convgate_core::errors::OperationError;
use convgate_core::ids::JobId;

use crate::engine::{ConversionEngine, ConversionJob};

const PLN_TO_IFC_STAGES: &[(u8, &str)] = &[
    (20, "Closing current project"),
    (30, "Opening .pln project"),
    (50, "Preparing IFC export"),
    (70, "Exporting to IFC"),
];

const IFC_TO_PLN_STAGES: &[(u8, &str)] = &[
    (20, "Closing current project"),
    (40, "Loading IFC file"),
    (70, "Saving as PLN file"),
];

const CANCEL_POLL: Duration = Duration::from_millis(10);

pub struct SimulatedEngine {
    step_delay: Duration,
}

impl SimulatedEngine {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }

    pub fn stages(direction: Direction) -> &'static [(u8, &'static str)] {
        match direction {
            Direction::PlnToIfc => PLN_TO_IFC_STAGES,
            Direction::IfcToPln => IFC_TO_PLN_STAGES,
        }
    }

    /// Sleep for one step, waking periodically to observe cancellation.
    fn pause(&self, job: &ConversionJob<'_>) -> Result<(), OperationError> {
        let deadline = Instant::now() + self.step_delay;
        loop {
            job.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(CANCEL_POLL.min(deadline - now));
        }
    }
}

fn require_file(path: &str) -> Result<(), OperationError> {
    if Path::new(path).is_file() {
        Ok(())
    } else {
        Err(OperationError::Failed(format!("Input file not found: {path}")))
    }
}

impl ConversionEngine for SimulatedEngine {
    fn convert(&self, job: &ConversionJob<'_>) -> Result<(), OperationError> {
        require_file(job.input_path)?;

        for &(percent, message) in Self::stages(job.direction) {
            job.checkpoint()?;
            job.progress.report(percent, message);
            self.pause(job)?;
        }
        job.checkpoint()?;

        let output = Path::new(job.output_path);
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                OperationError::Failed(format!("Cannot create output directory: {e}"))
            })?;
        }
        std::fs::copy(job.input_path, output)
            .map_err(|e| OperationError::Failed(format!("Failed to write output: {e}")))?;

        tracing::debug!(job_id = %job.job_id, output = %job.output_path, "simulated conversion written");
        Ok(())
    }

    fn load(&self, job_id: &JobId, input_path: &str) -> Result<(), OperationError> {
        require_file(input_path)?;
        std::thread::sleep(self.step_delay);
        tracing::debug!(job_id = %job_id, input = %input_path, "simulated load");
        Ok(())
    }

    fn reset_document(&self) -> Result<(), OperationError> {
        tracing::debug!("opening blank template");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use convgate_core::events::{EventBus, EventKind, JobEvent};
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::coordinator::{JobCoordinator, NoopCleanup, ProgressReporter};

    fn drain(rx: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn run_convert(
        engine: &SimulatedEngine,
        direction: Direction,
        input: &str,
        output: &str,
        cancel_first: bool,
    ) -> (Result<(), OperationError>, Vec<JobEvent>) {
        let (bus, mut rx) = EventBus::channel();
        let coord = JobCoordinator::new(Arc::new(NoopCleanup), bus);
        let permit = coord.try_admit(JobId::from_raw("J1")).unwrap();
        if cancel_first {
            coord.cancel(permit.job_id());
        }
        let job = ConversionJob {
            job_id: permit.job_id(),
            direction,
            input_path: input,
            output_path: output,
            progress: ProgressReporter::new(&permit),
            cancel: permit.cancel_token(),
        };
        let result = engine.convert(&job);
        let events = drain(&mut rx);
        drop(job);
        permit.finish(crate::coordinator::JobOutcome::Cancelled);
        (result, events)
    }

    #[test]
    fn converts_through_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("model.pln");
        std::fs::write(&input, b"pln-bytes").unwrap();
        let output = dir.path().join("out").join("model.ifc");

        let engine = SimulatedEngine::new(Duration::ZERO);
        let (result, events) = run_convert(
            &engine,
            Direction::PlnToIfc,
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            false,
        );
        result.unwrap();

        let progress: Vec<_> = events
            .iter()
            .map(|e| (e.progress.unwrap(), e.message.as_str()))
            .collect();
        assert_eq!(progress, PLN_TO_IFC_STAGES.to_vec());
        assert!(events.iter().all(|e| e.kind == EventKind::Progress));
        assert_eq!(std::fs::read(&output).unwrap(), b"pln-bytes");
    }

    #[test]
    fn reverse_direction_uses_its_own_stages() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("model.ifc");
        std::fs::write(&input, b"ifc").unwrap();
        let output = dir.path().join("model.pln");

        let (result, events) = run_convert(
            &SimulatedEngine::new(Duration::ZERO),
            Direction::IfcToPln,
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            false,
        );
        result.unwrap();
        let pcts: Vec<_> = events.iter().map(|e| e.progress.unwrap()).collect();
        assert_eq!(pcts, vec![20, 40, 70]);
    }

    #[test]
    fn missing_input_fails_before_any_progress() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.pln");
        let (result, events) = run_convert(
            &SimulatedEngine::new(Duration::ZERO),
            Direction::PlnToIfc,
            missing.to_str().unwrap(),
            "/tmp/unused.ifc",
            false,
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("not found"), "got: {err}");
        assert!(events.is_empty());
    }

    #[test]
    fn cancellation_stops_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("model.pln");
        std::fs::write(&input, b"x").unwrap();
        let output = dir.path().join("model.ifc");

        let (result, events) = run_convert(
            &SimulatedEngine::new(Duration::from_secs(10)),
            Direction::PlnToIfc,
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            true,
        );
        assert_eq!(result.unwrap_err(), OperationError::Cancelled);
        assert!(events.is_empty());
        assert!(!output.exists());
    }

    #[test]
    fn load_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("m.ifc");
        let engine = SimulatedEngine::new(Duration::ZERO);
        assert!(engine.load(&JobId::from_raw("L1"), input.to_str().unwrap()).is_err());
        std::fs::write(&input, b"ifc").unwrap();
        assert!(engine.load(&JobId::from_raw("L1"), input.to_str().unwrap()).is_ok());
    }
}
