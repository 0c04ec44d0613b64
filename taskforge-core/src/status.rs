//! Per-job runtime record (§3, §4.4) and its three small state machines.
//!
//! `JobStatus` is plain data: no back-reference to the runner or to other
//! statuses. All decision procedures that the original expresses as methods
//! on the status object itself (because it held a runner back-pointer) are
//! implemented instead as [`crate::runner::Runner`] methods keyed by
//! `job_id`, so this struct never needs interior mutability shared across
//! owners.

use crate::error::{InternalInvariantError, JobError};
use crate::fingerprint::FingerprintMap;
use std::collections::HashMap;

/// Terminal and non-terminal run states. Once a job reaches one of the four
/// terminal variants it may never be reassigned (§3 invariant 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    ReadyToRun,
    Success,
    Failed,
    UpstreamFailed,
    Skipped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::UpstreamFailed | JobState::Skipped
        )
    }
}

/// Whether this job's inputs have been compared against history yet, and
/// with what result. One-way: once set away from `Unknown` it never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Unknown,
    Validated,
    Invalidated,
    UpstreamFailed,
}

/// The pull-model should-run decision (§4.4). `Maybe` means "not yet
/// decided"; `Yes`/`No` are sticky once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldRun {
    Yes,
    No,
    Maybe,
}

/// Diagnostic payload recorded on a terminal failure state.
#[derive(Debug, Clone)]
pub enum Diagnostic {
    Job(JobError),
    UpstreamFailed { origin: String, message: String },
    Died { signal: Option<i32>, detail: String },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::Job(e) => write!(f, "{e}"),
            Diagnostic::UpstreamFailed { origin, message } => {
                write!(f, "upstream '{origin}' failed: {message}")
            }
            Diagnostic::Died { signal, detail } => match signal {
                Some(s) => write!(f, "job died (signal {s}): {detail}"),
                None => write!(f, "job died: {detail}"),
            },
        }
    }
}

/// Per-job runtime record. One instance per job in the extended DAG, created
/// at run start and mutated only by [`crate::runner::Runner`] methods.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: String,
    state: JobState,
    validation_state: ValidationState,
    pub should_run: ShouldRun,

    pub historical_input: FingerprintMap,
    pub historical_output: FingerprintMap,
    pub updated_input: FingerprintMap,
    pub updated_output: FingerprintMap,

    /// How many of this job's declared inputs have been produced so far
    /// this run. Mirrors the source's `input_done_counter`.
    pub input_done_counter: usize,
    pub upstreams_completed: bool,

    pub start_time: Option<i64>,
    pub run_time_secs: Option<f64>,

    pub error: Option<Diagnostic>,
    pub captured_stdout: Option<String>,
    pub captured_stderr: Option<String>,
}

impl JobStatus {
    pub fn new(job_id: impl Into<String>) -> Self {
        JobStatus {
            job_id: job_id.into(),
            state: JobState::Waiting,
            validation_state: ValidationState::Unknown,
            should_run: ShouldRun::Maybe,
            historical_input: HashMap::new(),
            historical_output: HashMap::new(),
            updated_input: HashMap::new(),
            updated_output: HashMap::new(),
            input_done_counter: 0,
            upstreams_completed: false,
            start_time: None,
            run_time_secs: None,
            error: None,
            captured_stdout: None,
            captured_stderr: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Attempts the state transition, enforcing the terminal-once invariant.
    /// Callers (the `Runner`) are responsible for triggering the follow-on
    /// propagation the source fires from its property setter.
    pub fn set_state(&mut self, value: JobState) -> Result<(), InternalInvariantError> {
        if self.state.is_terminal() {
            return Err(InternalInvariantError::TerminalStateOverwrite(
                self.job_id.clone(),
            ));
        }
        self.state = value;
        Ok(())
    }

    pub fn validation_state(&self) -> ValidationState {
        self.validation_state
    }

    /// One-way transition away from `Unknown`. Setting the same value twice
    /// is a no-op; setting a second, different value is a bug.
    pub fn set_validation_state(
        &mut self,
        value: ValidationState,
    ) -> Result<(), InternalInvariantError> {
        if self.validation_state == value {
            return Ok(());
        }
        if self.validation_state != ValidationState::Unknown {
            return Err(InternalInvariantError::TerminalStateOverwrite(
                self.job_id.clone(),
            ));
        }
        self.validation_state = value;
        Ok(())
    }
}

pub type StatusTable = HashMap<String, JobStatus>;
