//! Incremental, dependency-aware job execution engine: builds an extended
//! DAG from a user-declared job table, runs it through a single-threaded
//! event loop that dispatches job bodies onto worker threads or isolated
//! child processes, and persists a content-addressed history so unchanged
//! work is skipped on the next run.

pub mod config;
pub mod dag;
pub mod error;
pub mod events;
pub mod execution;
pub mod fingerprint;
pub mod history;
pub mod job;
pub mod jobs;
pub mod logging;
pub mod pool;
pub mod runner;
pub mod status;

pub use dag::{ExtendedGraph, UserDag};
pub use error::{GraphError, InternalInvariantError, JobError, RunError};
pub use fingerprint::{Fingerprint, FingerprintMap, ProbeResult};
pub use job::{Job, JobKind, Resources};
pub use runner::{JobResult, ResultMap, RunConfig, Runner};
pub use status::{Diagnostic, JobState, JobStatus, ShouldRun, ValidationState};
