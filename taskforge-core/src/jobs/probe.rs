//! `DownstreamNeedsMeChecker` (§4.3): the conditional-run probe the DAG
//! extender inserts ahead of every `Temp` job, one per non-`Cleanup`
//! downstream. Its single output is the `Force`/`Ignore` sentinel that
//! short-circuits the guarded Temp job's invalidation comparison.

use crate::error::JobError;
use crate::fingerprint::{Fingerprint, FingerprintMap, ProbeResult};
use crate::job::{Job, JobKind, Resources};
use crate::runner::RunContext;

#[derive(Debug)]
pub struct DownstreamNeedsMeChecker {
    job_id: String,
    outputs: [String; 1],
    downstream_id: String,
}

impl DownstreamNeedsMeChecker {
    pub fn new(job_id: impl Into<String>, downstream_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let outputs = [job_id.clone()];
        DownstreamNeedsMeChecker {
            job_id,
            outputs,
            downstream_id: downstream_id.into(),
        }
    }
}

impl Job for DownstreamNeedsMeChecker {
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
        ctx: &RunContext,
        _historical_output: &FingerprintMap,
    ) -> Result<FingerprintMap, JobError> {
        let result = if ctx.output_needed(&self.downstream_id) {
            ProbeResult::Force
        } else {
            ProbeResult::Ignore
        };
        let mut outputs = FingerprintMap::new();
        outputs.insert(self.job_id.clone(), result);
        Ok(outputs)
    }
}
