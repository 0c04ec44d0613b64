//! `TempFileGeneratingJob` (§4.8): a `FileGeneratingJob` whose materialization
//! is conditional on whether any non-cleanup downstream still needs it. The
//! conditional-run probe the DAG extender inserts ahead of it (§4.3) is what
//! actually drives invalidation; `output_needed` here exists to satisfy the
//! job contract uniformly and for direct testing. It also registers a
//! `CleanupJob` over its own declared files, so the DAG extender wires one in
//! automatically once every consumer is terminal.

use crate::error::JobError;
use crate::fingerprint::{Fingerprint, FingerprintMap};
use crate::job::{Job, JobKind, Resources};
use crate::jobs::cleanup::CleanupJob;
use crate::jobs::file_generating::FileGeneratingJob;
use crate::runner::RunContext;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
pub struct TempFileGeneratingJob {
    inner: FileGeneratingJob,
}

impl TempFileGeneratingJob {
    pub fn from_file_generating(inner: FileGeneratingJob) -> Self {
        TempFileGeneratingJob { inner }
    }
}

impl Job for TempFileGeneratingJob {
    fn job_id(&self) -> &str {
        self.inner.job_id()
    }

    fn outputs(&self) -> &[String] {
        self.inner.outputs()
    }

    fn kind(&self) -> JobKind {
        JobKind::Temp
    }

    fn resources(&self) -> Resources {
        self.inner.resources()
    }

    fn is_conditional(&self) -> bool {
        true
    }

    /// Union over this job's non-`Cleanup` direct downstreams' own
    /// `output_needed`.
    fn output_needed(&self, ctx: &RunContext) -> bool {
        ctx.direct_downstreams(self.job_id())
            .into_iter()
            .filter(|d| ctx.job_kind(d) != Some(JobKind::Cleanup))
            .any(|d| ctx.output_needed(&d))
    }

    fn compare_hashes(&self, old: &Fingerprint, new: &Fingerprint) -> bool {
        self.inner.compare_hashes(old, new)
    }

    fn run(
        &self,
        ctx: &RunContext,
        historical_output: &FingerprintMap,
    ) -> Result<FingerprintMap, JobError> {
        self.inner.run(ctx, historical_output)
    }

    fn cleanup_job_class(&self) -> Option<Arc<dyn Job>> {
        let paths: Vec<PathBuf> = self.outputs().iter().map(PathBuf::from).collect();
        Some(Arc::new(CleanupJob::new(
            format!("CleanUp:{}", self.job_id()),
            paths,
        )))
    }
}
