//! `LoadingJob` (§4.8): loads an externally-produced artifact into memory
//! and publishes its fingerprint without writing anything new.

use crate::error::JobError;
use crate::fingerprint::{Fingerprint, FingerprintMap, ProbeResult};
use crate::job::{Job, JobKind, Resources};
use crate::jobs::file_generating::fingerprint_path;
use crate::runner::RunContext;
use std::path::PathBuf;

#[derive(Debug)]
pub struct LoadingJob {
    job_id: String,
    outputs: [String; 1],
    path: PathBuf,
}

impl LoadingJob {
    pub fn new(job_id: impl Into<String>, output_name: impl Into<String>, path: PathBuf) -> Self {
        LoadingJob {
            job_id: job_id.into(),
            outputs: [output_name.into()],
            path,
        }
    }
}

impl Job for LoadingJob {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn kind(&self) -> JobKind {
        JobKind::Loading
    }

    fn resources(&self) -> Resources {
        Resources::RunsHere
    }

    fn output_needed(&self, _ctx: &RunContext) -> bool {
        !self.path.exists()
    }

    fn compare_hashes(&self, old: &Fingerprint, new: &Fingerprint) -> bool {
        match (old, new) {
            (Fingerprint::File { hash: h1, .. }, Fingerprint::File { hash: h2, .. }) => h1 == h2,
            _ => old == new,
        }
    }

    fn run(
        &self,
        _ctx: &RunContext,
        _historical_output: &FingerprintMap,
    ) -> Result<FingerprintMap, JobError> {
        let fp = fingerprint_path(&self.path)?;
        let mut outputs = FingerprintMap::new();
        outputs.insert(self.outputs[0].clone(), ProbeResult::Value(fp));
        Ok(outputs)
    }
}
