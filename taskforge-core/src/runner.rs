//! Top-Level Runner (C7) plus the Job Status Machine (C4) and Event Loop
//! (C5) decision procedures, all expressed as methods on [`Runner`] per the
//! arena-and-index design (§9): no job or status holds a back-reference,
//! every lookup goes through `job_id`.

use crate::dag::{self, ExtendedGraph, UserDag};
use crate::error::{InternalInvariantError, JobError, RunError};
use crate::events::{Event, EventQueue};
use crate::execution::{self, Isolation, Outcome};
use crate::fingerprint::{self, FingerprintMap, ProbeResult};
use crate::history::{self, History, JobHistoryRecord};
use crate::job::Job;
use crate::pool::ResourcePool;
use crate::status::{Diagnostic, JobState, JobStatus, ShouldRun, StatusTable, ValidationState};
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Layered run configuration (C9 threads its resolved values in here).
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub run_dir: PathBuf,
    pub history_dir: Option<PathBuf>,
    pub graph_name: String,
    pub cores: usize,
    pub always_capture_output: bool,
    pub raise_on_job_error: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            run_dir: PathBuf::from(".graphrunner-run"),
            history_dir: None,
            graph_name: "default".to_string(),
            cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            always_capture_output: false,
            raise_on_job_error: false,
        }
    }
}

/// A cheap, `Send + Sync + Clone` handle onto the live scheduler state.
/// Passed to every [`Job`] capability call: `output_needed` reads it
/// synchronously from the event-loop thread; `run` is handed the same type
/// when dispatched onto a worker thread, where it only ever uses `run_dir`.
#[derive(Clone)]
pub struct RunContext {
    graph: Arc<ExtendedGraph>,
    statuses: Arc<Mutex<StatusTable>>,
    run_dir: Arc<PathBuf>,
}

impl RunContext {
    /// Builds a context with no live status table, for the isolated-worker
    /// entry point (§4.6): the re-exec'd process only ever runs a single
    /// `FileGenerating`/`TempFileGenerating` job body, neither of which
    /// consults `should_run`.
    pub fn standalone(graph: ExtendedGraph, run_dir: PathBuf) -> RunContext {
        RunContext {
            graph: Arc::new(graph),
            statuses: Arc::new(Mutex::new(StatusTable::new())),
            run_dir: Arc::new(run_dir),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// "If `job_id` is not rerun, would its declared output be absent or
    /// unusable?" Delegates to the job itself so the answer stays in one
    /// place (§6.2).
    pub fn output_needed(&self, job_id: &str) -> bool {
        match self.graph.jobs.get(job_id) {
            Some(job) => job.output_needed(self),
            None => false,
        }
    }

    pub fn direct_downstreams(&self, job_id: &str) -> Vec<String> {
        self.graph.direct_downstreams(job_id)
    }

    pub fn should_run(&self, job_id: &str) -> ShouldRun {
        self.statuses
            .lock()
            .unwrap()
            .get(job_id)
            .map(|s| s.should_run)
            .unwrap_or(ShouldRun::Maybe)
    }

    pub fn job_kind(&self, job_id: &str) -> Option<crate::job::JobKind> {
        self.graph.jobs.get(job_id).map(|j| j.kind())
    }
}

/// Snapshot of one job's outcome, returned to the caller once the run
/// completes (§6.4). Plain data -- no lock, no back-reference.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub state: JobState,
    pub error: Option<Diagnostic>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub run_time_secs: Option<f64>,
}

pub type ResultMap = HashMap<String, JobResult>;

pub struct Runner {
    graph: Arc<ExtendedGraph>,
    statuses: Arc<Mutex<StatusTable>>,
    queue: EventQueue,
    pool: Arc<ResourcePool>,
    isolation: Isolation,
    config: RunConfig,
    history: History,
    logger: Option<crate::logging::RunLogger>,
    interrupted: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(
        user_dag: UserDag,
        config: RunConfig,
        isolation: Isolation,
    ) -> Result<Self, RunError> {
        let extended = dag::extend(user_dag)?;

        let history_path = config
            .history_dir
            .as_ref()
            .map(|dir| history::history_file_path(dir, &config.graph_name));
        let history = match &history_path {
            Some(path) => history::load(path)?,
            None => History::new(),
        };

        let mut statuses = StatusTable::new();
        for job_id in extended.jobs.keys() {
            let mut status = JobStatus::new(job_id.clone());
            if let Some(record) = history.get(job_id) {
                status.historical_input = record.input.clone();
                status.historical_output = record.output.clone();
            }
            statuses.insert(job_id.clone(), status);
        }

        let pool = ResourcePool::new(config.cores.max(1));
        let logger = match &config.history_dir {
            Some(dir) => crate::logging::RunLogger::new(dir, &config.graph_name).ok(),
            None => None,
        };

        Ok(Runner {
            graph: Arc::new(extended),
            statuses: Arc::new(Mutex::new(statuses)),
            queue: EventQueue::new(),
            pool,
            isolation,
            config,
            history,
            logger,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Clone of the interrupt flag this runner polls between dispatch
    /// cycles. Hand it to a `ctrlc::set_handler` closure (or flip it
    /// directly) to request a graceful, history-preserving stop (§5
    /// Cancellation/timeouts).
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    fn context(&self) -> RunContext {
        RunContext {
            graph: Arc::clone(&self.graph),
            statuses: Arc::clone(&self.statuses),
            run_dir: Arc::new(self.config.run_dir.clone()),
        }
    }

    /// Runs the graph to quiescence (C7 sequence) and returns the final
    /// per-job results. History is persisted even when the run was
    /// interrupted or ended with a failed job, so this always writes a
    /// usable history file before returning.
    pub fn run(&mut self) -> Result<ResultMap, RunError> {
        std::fs::create_dir_all(&self.config.run_dir).map_err(RunError::History)?;

        self.seed_initial_events();
        let pump_result = self.pump();
        let persist_result = self.persist_history();

        pump_result?;
        persist_result?;

        let any_failed = {
            let statuses = self.statuses.lock().unwrap();
            statuses.values().any(|s| s.state() == JobState::Failed)
        };

        let results = self.snapshot();
        if any_failed && self.config.raise_on_job_error {
            return Err(RunError::RunFailed);
        }
        Ok(results)
    }

    fn snapshot(&self) -> ResultMap {
        let statuses = self.statuses.lock().unwrap();
        statuses
            .values()
            .map(|s| {
                (
                    s.job_id.clone(),
                    JobResult {
                        state: s.state(),
                        error: s.error.clone(),
                        stdout: s.captured_stdout.clone(),
                        stderr: s.captured_stderr.clone(),
                        run_time_secs: s.run_time_secs,
                    },
                )
            })
            .collect()
    }

    // ---- C7: seeding ----------------------------------------------------

    /// Decides `should_run` for every job in reverse topological order (so
    /// a conditional job's downstreams are already decided when it asks
    /// them). `update_should_run` itself fires the `JobReady`/`JobSkipped`
    /// event once a job's decision and upstream state allow it, so a single
    /// pass is enough -- a second explicit dispatch pass would double-fire
    /// sourceless jobs.
    fn seed_initial_events(&mut self) {
        let mut order = petgraph::algo::toposort(&self.graph.graph, None)
            .expect("extended DAG is acyclic by construction");
        order.reverse();
        let ids: Vec<String> = order.into_iter().map(|idx| self.graph.graph[idx].clone()).collect();

        for job_id in &ids {
            self.update_should_run(job_id);
        }
    }

    // ---- C4: decision procedures -----------------------------------------

    fn all_upstreams_terminal(&self, job_id: &str) -> bool {
        let statuses = self.statuses.lock().unwrap();
        self.graph
            .direct_upstreams(job_id)
            .iter()
            .all(|u| statuses.get(u).map(|s| s.state().is_terminal()).unwrap_or(true))
    }

    fn all_upstreams_terminal_or_conditional(&self, job_id: &str) -> bool {
        let statuses = self.statuses.lock().unwrap();
        for upstream in self.graph.direct_upstreams(job_id) {
            let Some(status) = statuses.get(&upstream) else {
                continue;
            };
            if status.state().is_terminal() {
                continue;
            }
            let is_conditional = self
                .graph
                .jobs
                .get(&upstream)
                .map(|j| j.is_conditional())
                .unwrap_or(false);
            if !is_conditional {
                return false;
            }
            if status.should_run == ShouldRun::Yes
                || status.validation_state() == ValidationState::Invalidated
            {
                return false;
            }
        }
        true
    }

    /// §4.4 `update_should_run`: a pull-model decision that, once it
    /// resolves to `Yes`/`No`, recurses into conditional upstreams so the
    /// decision propagates backward through the graph.
    fn update_should_run(&mut self, job_id: &str) {
        let current = self.statuses.lock().unwrap().get(job_id).map(|s| s.should_run);
        let Some(current) = current else { return };
        if matches!(current, ShouldRun::Yes | ShouldRun::No) {
            self.run_now_if_ready(job_id);
            return;
        }

        let Some(job) = self.graph.jobs.get(job_id).cloned() else {
            return;
        };
        let validation_state = self
            .statuses
            .lock()
            .unwrap()
            .get(job_id)
            .map(|s| s.validation_state())
            .unwrap_or(ValidationState::Unknown);

        let result = if validation_state == ValidationState::Invalidated {
            ShouldRun::Yes
        } else if !job.is_conditional() {
            // An output job's own file may already satisfy `output_needed`,
            // but that tells us nothing about whether its inputs changed --
            // only `consider_invalidation`, run once every upstream has
            // reported in, can tell us that. Deciding early here would
            // freeze a stale No before the first upstream even finishes.
            if !self.all_upstreams_terminal_or_conditional(job_id) {
                ShouldRun::Maybe
            } else {
                let ctx = self.context();
                if job.output_needed(&ctx) {
                    ShouldRun::Yes
                } else {
                    ShouldRun::No
                }
            }
        } else {
            let downstreams = self.graph.direct_downstreams(job_id);
            let statuses = self.statuses.lock().unwrap();
            let mut any_yes = false;
            let mut no_count = 0usize;
            for downstream in &downstreams {
                match statuses.get(downstream).map(|s| s.should_run) {
                    Some(ShouldRun::Yes) => {
                        any_yes = true;
                        break;
                    }
                    Some(ShouldRun::No) => no_count += 1,
                    _ => {}
                }
            }
            drop(statuses);
            if any_yes {
                ShouldRun::Yes
            } else if no_count == downstreams.len() {
                ShouldRun::No
            } else {
                ShouldRun::Maybe
            }
        };

        let changed = current != result;
        if changed {
            self.statuses.lock().unwrap().get_mut(job_id).unwrap().should_run = result;
            self.job_decided_whether_to_run(job_id);
        }
        if matches!(result, ShouldRun::Yes | ShouldRun::No) {
            self.run_now_if_ready(job_id);
        }
    }

    /// A should-run decision just got made; conditional upstreams may now
    /// be able to resolve theirs.
    fn job_decided_whether_to_run(&mut self, job_id: &str) {
        let upstreams = self.graph.direct_upstreams(job_id);
        for upstream in upstreams {
            let is_conditional = self
                .graph
                .jobs
                .get(&upstream)
                .map(|j| j.is_conditional())
                .unwrap_or(false);
            if is_conditional {
                self.update_should_run(&upstream);
            }
        }
    }

    /// §4.4 `run_now_if_ready`: enabled only once every upstream is
    /// terminal. Emits `JobReady` or `JobSkipped` depending on the
    /// already-decided `should_run`.
    fn run_now_if_ready(&mut self, job_id: &str) {
        if !self.all_upstreams_terminal(job_id) {
            return;
        }
        let should_run = self.statuses.lock().unwrap().get(job_id).map(|s| s.should_run);
        match should_run {
            Some(ShouldRun::Yes) => self.push_event(Event::JobReady(job_id.to_string())),
            Some(ShouldRun::No) => self.push_event(Event::JobSkipped(job_id.to_string())),
            _ => {}
        }
    }

    fn push_event(&mut self, event: Event) {
        if let Some(logger) = &mut self.logger {
            logger.event("push", &format!("{event:?}"));
        }
        self.queue.push(event);
    }

    /// §4.4 `_consider_invalidation`.
    fn consider_invalidation(&self, job_id: &str) -> bool {
        let statuses = self.statuses.lock().unwrap();
        let Some(status) = statuses.get(job_id) else {
            return false;
        };
        let old_input = &status.historical_input;
        let new_input = &status.updated_input;

        if old_input.len() != new_input.len() {
            return true;
        }

        let old_keys: std::collections::HashSet<_> = old_input.keys().collect();
        let new_keys: std::collections::HashSet<_> = new_input.keys().collect();

        if old_keys == new_keys {
            for (key, old_value) in old_input {
                let new_value = &new_input[key];
                if !self.compare_via_owner(key, Some(old_value), new_value) {
                    return true;
                }
            }
            false
        } else {
            for (old_key, old_value) in old_input {
                if let Some(new_value) = new_input.get(old_key) {
                    if !self.compare_via_owner(old_key, Some(old_value), new_value) {
                        return true;
                    }
                } else {
                    let count = fingerprint::count_rename_candidates(new_input, old_value);
                    if count != 1 {
                        return true;
                    }
                }
            }
            false
        }
    }

    fn compare_via_owner(&self, output_name: &str, old: Option<&ProbeResult>, new: &ProbeResult) -> bool {
        let owner = self
            .graph
            .jobs
            .values()
            .find(|job| job.outputs().iter().any(|o| o == output_name));
        match owner {
            Some(owner) => fingerprint::compare(old, new, |a, b| owner.compare_hashes(a, b)),
            None => fingerprint::compare(old, new, |_, _| false),
        }
    }

    /// §4.4 "on upstream completion": merges `upstream_output` into this
    /// job's `updated_input` for declared names, then runs invalidation
    /// once every non-terminal upstream is conditional-or-done.
    fn update_from_upstream_output(&mut self, job_id: &str, upstream_output: &FingerprintMap) {
        let declared_inputs = self.graph.inputs.get(job_id).cloned().unwrap_or_default();
        {
            let mut statuses = self.statuses.lock().unwrap();
            let Some(status) = statuses.get_mut(job_id) else {
                return;
            };
            for (name, value) in upstream_output {
                if declared_inputs.contains(name) {
                    status.updated_input.insert(name.clone(), value.clone());
                }
            }
            if status.validation_state() == ValidationState::Invalidated {
                return;
            }
        }

        if self.all_upstreams_terminal_or_conditional(job_id) {
            let invalidated = self.consider_invalidation(job_id);
            let mut statuses = self.statuses.lock().unwrap();
            if let Some(status) = statuses.get_mut(job_id) {
                let new_state = if invalidated {
                    ValidationState::Invalidated
                } else {
                    ValidationState::Validated
                };
                let _ = status.set_validation_state(new_state);
            }
        }
    }

    // ---- C5: event loop ---------------------------------------------------

    fn pump(&mut self) -> Result<(), RunError> {
        let (tx, rx) = crossbeam_channel::unbounded::<Event>();
        let mut outstanding = 0usize;
        let mut interrupted = false;

        loop {
            if self.interrupted.load(Ordering::Relaxed) {
                interrupted = true;
                break;
            }
            if let Some(event) = self.queue.pop() {
                if let Some(logger) = &mut self.logger {
                    logger.event("pop", &format!("{event:?}"));
                }
                self.handle_event(event, &tx, &mut outstanding);
            } else if outstanding > 0 {
                match rx.recv() {
                    Ok(event) => {
                        if let Some(logger) = &mut self.logger {
                            logger.event("recv", &format!("{event:?}"));
                        }
                        self.queue.push(event);
                    }
                    Err(_) => break,
                }
            } else {
                break;
            }
        }

        if interrupted {
            if let Some(logger) = &mut self.logger {
                logger.log("interrupted: waiting for outstanding workers before exit");
            }
            while outstanding > 0 {
                if rx.recv().is_err() {
                    break;
                }
                outstanding -= 1;
            }
            return Err(RunError::RunFailed);
        }

        let statuses = self.statuses.lock().unwrap();
        for (job_id, status) in statuses.iter() {
            if !status.state().is_terminal() {
                return Err(RunError::Internal(InternalInvariantError::NonTerminalAtQuiescence(
                    job_id.clone(),
                )));
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event, tx: &Sender<Event>, outstanding: &mut usize) {
        match event {
            Event::JobReady(job_id) => {
                *outstanding += 1;
                self.dispatch_ready(job_id, tx.clone());
            }
            Event::JobSuccess(job_id, outputs, captured) => {
                *outstanding -= 1;
                self.handle_success(&job_id, outputs, captured);
            }
            Event::JobSkipped(job_id) => self.handle_skipped(&job_id),
            Event::JobFailed(job_id, diag) => {
                *outstanding -= 1;
                self.handle_failed(&job_id, diag);
            }
            Event::JobUpstreamFailed(_) => {
                // bookkeeping only, terminal state already set by the cascade
            }
        }
    }

    fn dispatch_ready(&mut self, job_id: String, tx: Sender<Event>) {
        {
            let mut statuses = self.statuses.lock().unwrap();
            if let Some(status) = statuses.get_mut(&job_id) {
                status.start_time = Some(now_secs());
                let _ = status.set_state(JobState::ReadyToRun);
            }
        }
        if let Some(logger) = &mut self.logger {
            logger.job_started(&job_id);
        }

        let job = match self.graph.jobs.get(&job_id) {
            Some(job) => Arc::clone(job),
            None => return,
        };
        let historical_output = self
            .statuses
            .lock()
            .unwrap()
            .get(&job_id)
            .map(|s| s.historical_output.clone())
            .unwrap_or_default();
        let ctx = self.context();
        let pool = Arc::clone(&self.pool);
        let resources = job.resources();
        let isolation = self.isolation.clone();
        let always_capture_output = self.config.always_capture_output;

        std::thread::spawn(move || {
            let _permit = pool.acquire(resources);
            let outcome = execution::execute(
                job.as_ref(),
                &isolation,
                &ctx,
                &historical_output,
                always_capture_output,
            );
            let event = match outcome {
                Outcome::Success(outputs, captured) => {
                    Event::JobSuccess(job_id, outputs, captured)
                }
                Outcome::Failed(diag) => Event::JobFailed(job_id, diag),
            };
            let _ = tx.send(event);
        });
    }

    fn handle_success(
        &mut self,
        job_id: &str,
        outputs: FingerprintMap,
        captured: execution::CapturedOutput,
    ) {
        let declared: Vec<String> = self
            .graph
            .jobs
            .get(job_id)
            .map(|j| j.outputs().to_vec())
            .unwrap_or_default();

        for name in outputs.keys() {
            if !declared.contains(name) {
                self.handle_failed(
                    job_id,
                    Diagnostic::Job(JobError::UndeclaredOutput(name.clone())),
                );
                return;
            }
        }
        for name in &declared {
            if !outputs.contains_key(name) {
                self.handle_failed(
                    job_id,
                    Diagnostic::Job(JobError::OutputMissing(name.clone())),
                );
                return;
            }
        }

        let run_time_secs = {
            let mut statuses = self.statuses.lock().unwrap();
            let mut run_time_secs = None;
            if let Some(status) = statuses.get_mut(job_id) {
                status.updated_output = outputs.clone();
                status.captured_stdout = captured.stdout;
                status.captured_stderr = captured.stderr;
                if let Some(start) = status.start_time {
                    run_time_secs = Some((now_secs() - start) as f64);
                    status.run_time_secs = run_time_secs;
                }
                let _ = status.set_state(JobState::Success);
            }
            run_time_secs
        };
        if let Some(logger) = &mut self.logger {
            logger.job_finished(job_id, "succeeded", run_time_secs);
        }
        self.propagate_terminal(job_id, &outputs);
    }

    fn handle_skipped(&mut self, job_id: &str) {
        let historical_output = {
            let mut statuses = self.statuses.lock().unwrap();
            let Some(status) = statuses.get_mut(job_id) else {
                return;
            };
            status.updated_output = status.historical_output.clone();
            let _ = status.set_state(JobState::Skipped);
            status.updated_output.clone()
        };
        if let Some(logger) = &mut self.logger {
            logger.job_finished(job_id, "skipped", None);
        }
        self.propagate_terminal(job_id, &historical_output);
    }

    fn handle_failed(&mut self, job_id: &str, diagnostic: Diagnostic) {
        {
            let mut statuses = self.statuses.lock().unwrap();
            if let Some(status) = statuses.get_mut(job_id) {
                if status.state().is_terminal() {
                    return;
                }
                status.error = Some(diagnostic.clone());
                let _ = status.set_state(JobState::Failed);
            }
        }
        if let Some(logger) = &mut self.logger {
            logger.job_finished(job_id, &format!("failed: {diagnostic}"), None);
        }
        self.cascade_failure(job_id, &diagnostic);
    }

    /// Marks every transitive downstream `UpstreamFailed` with a diagnostic
    /// carrying the originating job id (§4.4 "on failure cascade").
    fn cascade_failure(&mut self, origin: &str, diagnostic: &Diagnostic) {
        let mut frontier: Vec<String> = self.graph.direct_downstreams(origin);
        let origin_message = diagnostic.to_string();

        while let Some(downstream) = frontier.pop() {
            let already_terminal = {
                let statuses = self.statuses.lock().unwrap();
                statuses.get(&downstream).map(|s| s.state().is_terminal()).unwrap_or(true)
            };
            if already_terminal {
                continue;
            }
            {
                let mut statuses = self.statuses.lock().unwrap();
                if let Some(status) = statuses.get_mut(&downstream) {
                    status.error = Some(Diagnostic::UpstreamFailed {
                        origin: origin.to_string(),
                        message: origin_message.clone(),
                    });
                    let _ = status.set_validation_state(ValidationState::UpstreamFailed);
                    let _ = status.set_state(JobState::UpstreamFailed);
                }
            }
            self.push_event(Event::JobUpstreamFailed(downstream.clone()));
            frontier.extend(self.graph.direct_downstreams(&downstream));
        }
    }

    /// §4.4 `job_became_terminal` for the `Success`/`Skipped` branch: feed
    /// this job's output into every direct downstream and re-run their
    /// should-run decision.
    fn propagate_terminal(&mut self, job_id: &str, outputs: &FingerprintMap) {
        let downstreams = self.graph.direct_downstreams(job_id);
        for downstream in downstreams {
            self.update_from_upstream_output(&downstream, outputs);
            self.update_should_run(&downstream);
            self.run_now_if_ready(&downstream);
        }
    }

    fn persist_history(&mut self) -> Result<(), RunError> {
        let Some(history_dir) = &self.config.history_dir else {
            return Ok(());
        };
        let path = history::history_file_path(history_dir, &self.config.graph_name);

        let statuses = self.statuses.lock().unwrap();
        for (job_id, status) in statuses.iter() {
            if status.state() == JobState::Failed {
                continue;
            }
            self.history.insert(
                job_id.clone(),
                JobHistoryRecord {
                    input: status.updated_input.clone(),
                    output: status.updated_output.clone(),
                },
            );
        }
        drop(statuses);

        history::save(&path, &self.history).map_err(RunError::History)
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
