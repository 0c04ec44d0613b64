//! The uniform job capability (§6.2): the one interface the scheduler
//! depends on. Concrete job kinds live in [`crate::jobs`]; the scheduler
//! never matches on them directly, only through this trait.

use crate::error::JobError;
use crate::fingerprint::{Fingerprint, FingerprintMap};
use crate::runner::RunContext;
use std::fmt;

/// What kind of node this is in the graph. Drives the DAG-extension rules
/// in [`crate::dag`] and the default conditionality in [`Job::is_conditional`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// An ordinary output-producing job.
    Output,
    /// Conditional: only materializes its output when some downstream
    /// actually needs it. Gets a probe inserted ahead of it (§4.3).
    Temp,
    /// Synthesized by a parent job's `cleanup_job_class`; runs once every
    /// consumer of the parent has reached a terminal state.
    Cleanup,
    /// A parameter or function invariant: no filesystem output, just a
    /// fingerprint of a value the caller supplies.
    Invariant,
    /// Loads an externally produced artifact into memory.
    Loading,
    /// Out of scope for the scheduler itself (spawns new jobs, requiring a
    /// fresh run one level up); retained as a tag for completeness.
    JobGenerating,
}

/// Resource class under which a job's body runs. See §4.6/§5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resources {
    /// Counts 1 against the worker pool.
    SingleCore,
    /// Counts the pool's full capacity; runs alone among core-consuming
    /// jobs but coexists with `RunsHere` jobs.
    AllCores,
    /// Runs alone; no other job is scheduled concurrently.
    Exclusive,
    /// Bypasses the pool entirely, runs synchronously on the event-loop
    /// thread (invariants, cleanup, internal probes).
    RunsHere,
}

/// The uniform job capability every node in the extended DAG implements.
pub trait Job: fmt::Debug + Send + Sync {
    /// Stable identity. Must be unique across the job table.
    fn job_id(&self) -> &str;

    /// Declared output names, in a stable order.
    fn outputs(&self) -> &[String];

    fn kind(&self) -> JobKind;

    fn resources(&self) -> Resources;

    /// True for jobs whose need-to-run depends on a downstream's
    /// need-to-run (Temp jobs, invariants wired conditionally). Defaults to
    /// `kind() == JobKind::Temp`; invariant jobs override this explicitly.
    fn is_conditional(&self) -> bool {
        matches!(self.kind(), JobKind::Temp)
    }

    /// "If I am not rerun, would my declared output be absent or unusable?"
    fn output_needed(&self, ctx: &RunContext) -> bool;

    /// Delegate equality check for two fingerprints of the same output.
    fn compare_hashes(&self, old: &Fingerprint, new: &Fingerprint) -> bool;

    /// Execute the job body, returning a fingerprint for every declared
    /// output. `historical_output` is this job's last recorded output map,
    /// handed to jobs (like loaders) that need to know what they produced
    /// last time.
    fn run(
        &self,
        ctx: &RunContext,
        historical_output: &FingerprintMap,
    ) -> Result<FingerprintMap, JobError>;

    /// A job may synthesize a cleanup job that runs once every direct
    /// successor of this job has reached a terminal state.
    fn cleanup_job_class(&self) -> Option<std::sync::Arc<dyn Job>> {
        None
    }
}
