//! `FunctionInvariantJob` (§4.8): stands in for "has the function that
//! produces some other job's output changed". A Rust closure's identity
//! cannot be introspected the way bytecode can be hashed in the source
//! system, so callers pass an explicit version marker -- see the Open
//! Question resolution in DESIGN.md.

use crate::error::JobError;
use crate::fingerprint::{Fingerprint, FingerprintMap, ProbeResult};
use crate::job::{Job, JobKind, Resources};
use crate::runner::RunContext;

#[derive(Debug)]
pub struct FunctionInvariantJob {
    job_id: String,
    outputs: [String; 1],
    version_hash: String,
}

impl FunctionInvariantJob {
    pub fn new(job_id: impl Into<String>, version_marker: &[u8]) -> Self {
        let job_id = job_id.into();
        let version_hash = blake3::hash(version_marker).to_hex().to_string();
        let outputs = [job_id.clone()];
        FunctionInvariantJob {
            job_id,
            outputs,
            version_hash,
        }
    }
}

impl Job for FunctionInvariantJob {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn kind(&self) -> JobKind {
        JobKind::Invariant
    }

    fn resources(&self) -> Resources {
        Resources::RunsHere
    }

    fn output_needed(&self, _ctx: &RunContext) -> bool {
        true
    }

    fn compare_hashes(&self, old: &Fingerprint, new: &Fingerprint) -> bool {
        old == new
    }

    fn run(
        &self,
        _ctx: &RunContext,
        _historical_output: &FingerprintMap,
    ) -> Result<FingerprintMap, JobError> {
        let mut outputs = FingerprintMap::new();
        outputs.insert(
            self.job_id.clone(),
            ProbeResult::Value(Fingerprint::Value(self.version_hash.clone())),
        );
        Ok(outputs)
    }
}
