//! Error taxonomy for the scheduler.
//!
//! Mirrors the error kinds of the original system: structural problems with
//! the graph are fatal and raised before any job runs, while a single job's
//! execution or contract failure is local and is reported through the
//! [`crate::status::JobStatus`] map rather than aborting the run.

use thiserror::Error;

/// Problems with the shape of the job graph itself. Always fatal, always
/// raised before the event loop starts.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("job graph contains a cycle after DAG extension")]
    NotADag,

    #[error("output '{output}' is claimed by both '{first}' and '{second}'")]
    OutputConflict {
        output: String,
        first: String,
        second: String,
    },

    #[error("job '{0}' depends on itself")]
    SelfDependency(String),

    #[error("job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },
}

/// A single job's failure to execute or to honor its declared contract.
/// Carried in [`crate::status::JobStatus::error`]; never unwinds the run.
#[derive(Debug, Error, Clone)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("job returned undeclared output '{0}'")]
    UndeclaredOutput(String),

    #[error("job declared output '{0}' but did not produce it")]
    OutputMissing(String),

    #[error("job produced empty output '{0}' but empty_ok=false")]
    EmptyOutputForbidden(String),

    #[error("upstream job '{0}' failed")]
    UpstreamFailed(String),

    #[error("job process died without a recoverable error: {0}")]
    Died(String),
}

/// A bug in the event loop itself: the queue drained with a non-terminal
/// status left on the table, or a terminal status was overwritten. Never
/// expected to be user-triggerable.
#[derive(Debug, Error)]
pub enum InternalInvariantError {
    #[error(
        "run finished with job '{0}' in a non-terminal state; this is a scheduler bug"
    )]
    NonTerminalAtQuiescence(String),

    #[error("attempted to overwrite terminal state of job '{0}'")]
    TerminalStateOverwrite(String),
}

/// Top-level error returned by [`crate::runner::Runner::run`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Internal(#[from] InternalInvariantError),

    #[error("run failed: one or more jobs ended in the Failed state")]
    RunFailed,

    #[error("history store error: {0}")]
    History(#[from] std::io::Error),
}
