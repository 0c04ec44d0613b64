//! `ParameterInvariantJob` (§4.8): no filesystem output, just a stable hash
//! of a caller-supplied parameter value. Forces downstream invalidation
//! whenever the parameter changes between runs. Like `FunctionInvariantJob`
//! it is not conditional: it always evaluates, since its only job is to
//! hand downstreams a fresh value to compare against history.

use crate::error::JobError;
use crate::fingerprint::{Fingerprint, FingerprintMap, ProbeResult};
use crate::job::{Job, JobKind, Resources};
use crate::runner::RunContext;

#[derive(Debug)]
pub struct ParameterInvariantJob {
    job_id: String,
    outputs: [String; 1],
    value_hash: String,
}

impl ParameterInvariantJob {
    pub fn new(job_id: impl Into<String>, value: &impl serde::Serialize) -> Self {
        let job_id = job_id.into();
        let bytes = serde_json::to_vec(value).expect("parameter value must serialize");
        let value_hash = blake3::hash(&bytes).to_hex().to_string();
        let outputs = [job_id.clone()];
        ParameterInvariantJob {
            job_id,
            outputs,
            value_hash,
        }
    }
}

impl Job for ParameterInvariantJob {
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
            ProbeResult::Value(Fingerprint::Value(self.value_hash.clone())),
        );
        Ok(outputs)
    }
}
