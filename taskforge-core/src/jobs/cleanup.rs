//! `CleanupJob` (§4.8): synthesized by a parent job's `cleanup_job_class`
//! factory. The DAG extender wires it to run only once every direct
//! consumer of the parent has reached a terminal state.

use crate::error::JobError;
use crate::fingerprint::{Fingerprint, FingerprintMap};
use crate::job::{Job, JobKind, Resources};
use crate::runner::RunContext;
use std::path::PathBuf;

#[derive(Debug)]
pub struct CleanupJob {
    job_id: String,
    outputs: Vec<String>,
    paths: Vec<PathBuf>,
}

impl CleanupJob {
    pub fn new(job_id: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        CleanupJob {
            job_id: job_id.into(),
            outputs: Vec::new(),
            paths,
        }
    }
}

impl Job for CleanupJob {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn kind(&self) -> JobKind {
        JobKind::Cleanup
    }

    fn resources(&self) -> Resources {
        Resources::RunsHere
    }

    fn output_needed(&self, _ctx: &RunContext) -> bool {
        true
    }

    fn compare_hashes(&self, _old: &Fingerprint, _new: &Fingerprint) -> bool {
        true
    }

    fn run(
        &self,
        _ctx: &RunContext,
        _historical_output: &FingerprintMap,
    ) -> Result<FingerprintMap, JobError> {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(JobError::Failed(format!(
                        "cleanup could not remove {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Ok(FingerprintMap::new())
    }
}
