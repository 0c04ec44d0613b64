//! Execution Backend (C6, §4.6): runs one ready job's body, either
//! synchronously on the event-loop thread or in an isolated child process.

use crate::error::JobError;
use crate::fingerprint::FingerprintMap;
use crate::job::{Job, Resources};
use crate::runner::RunContext;
use crate::status::Diagnostic;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// A length-prefixed, `bincode`-serialized failure frame, independent of
/// any host-language exception representation (§4.6 step 3, §9).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FailureFrame {
    pub kind: String,
    pub message: String,
    pub frames: Vec<String>,
}

impl From<&JobError> for FailureFrame {
    fn from(err: &JobError) -> Self {
        FailureFrame {
            kind: match err {
                JobError::Failed(_) => "Failed",
                JobError::UndeclaredOutput(_) => "UndeclaredOutput",
                JobError::OutputMissing(_) => "OutputMissing",
                JobError::EmptyOutputForbidden(_) => "EmptyOutputForbidden",
                JobError::UpstreamFailed(_) => "UpstreamFailed",
                JobError::Died(_) => "Died",
            }
            .to_string(),
            message: err.to_string(),
            frames: Vec::new(),
        }
    }
}

/// Stdout/stderr captured from an isolated child, when `always_capture_output`
/// is set (§4.6 step 4). Always empty for in-process (`RunsHere`/`Disabled`)
/// jobs, which have no scratch files to read from.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

pub enum Outcome {
    Success(FingerprintMap, CapturedOutput),
    Failed(Diagnostic),
}

/// How isolated-child execution is wired up. Unit tests and library
/// embedders that construct jobs from in-process closures have no binary to
/// re-exec, so they run every job body on the event-loop thread regardless
/// of its declared resource class -- see the corresponding Open Question
/// resolution in DESIGN.md.
#[derive(Clone)]
pub enum Isolation {
    Disabled,
    ChildProcess {
        current_exe: PathBuf,
        graph_path: PathBuf,
        run_dir: PathBuf,
    },
}

pub fn execute(
    job: &dyn Job,
    isolation: &Isolation,
    ctx: &RunContext,
    historical_output: &FingerprintMap,
    always_capture_output: bool,
) -> Outcome {
    match (job.resources(), isolation) {
        (Resources::RunsHere, _) | (_, Isolation::Disabled) => {
            run_in_process(job, ctx, historical_output)
        }
        (_, Isolation::ChildProcess { .. }) => {
            run_isolated(job, isolation, ctx, historical_output, always_capture_output)
        }
    }
}

fn run_in_process(job: &dyn Job, ctx: &RunContext, historical_output: &FingerprintMap) -> Outcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| job.run(ctx, historical_output)));
    match result {
        Ok(Ok(outputs)) => Outcome::Success(outputs, CapturedOutput::default()),
        Ok(Err(err)) => Outcome::Failed(Diagnostic::Job(err)),
        Err(payload) => {
            let message = panic_message(&payload);
            Outcome::Failed(Diagnostic::Died {
                signal: None,
                detail: message,
            })
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked with a non-string payload".to_string()
    }
}

fn run_isolated(
    job: &dyn Job,
    isolation: &Isolation,
    ctx: &RunContext,
    historical_output: &FingerprintMap,
    always_capture_output: bool,
) -> Outcome {
    let Isolation::ChildProcess {
        current_exe,
        graph_path,
        run_dir,
    } = isolation
    else {
        unreachable!("run_isolated only called with ChildProcess isolation")
    };

    let job_id = job.job_id();
    let stdout_path = run_dir.join(format!("{job_id}.stdout"));
    let stderr_path = run_dir.join(format!("{job_id}.stderr"));
    let exception_path = run_dir.join(format!("{job_id}.exception"));
    let result_path = run_dir.join(format!("{job_id}.result"));
    let historical_path = run_dir.join(format!("{job_id}.historical_input"));

    let _ = fs::remove_file(&exception_path);
    let _ = fs::remove_file(&result_path);

    if let Err(e) = write_bincode(&historical_path, historical_output) {
        return Outcome::Failed(Diagnostic::Died {
            signal: None,
            detail: format!("failed to stage historical output for worker: {e}"),
        });
    }

    let spawned = spawn_worker(
        current_exe,
        graph_path,
        job_id,
        &historical_path,
        run_dir,
        &stdout_path,
        &stderr_path,
        &exception_path,
        &result_path,
    );

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            return Outcome::Failed(Diagnostic::Died {
                signal: None,
                detail: format!("failed to spawn job worker: {e}"),
            })
        }
    };

    let status = match child.wait() {
        Ok(status) => status,
        Err(e) => {
            return Outcome::Failed(Diagnostic::Died {
                signal: None,
                detail: format!("failed to wait on job worker: {e}"),
            })
        }
    };

    let outcome = classify_exit(&status, &exception_path, &result_path, job, ctx);
    match outcome {
        Outcome::Success(outputs, _) if always_capture_output => {
            let captured = CapturedOutput {
                stdout: fs::read_to_string(&stdout_path).ok(),
                stderr: fs::read_to_string(&stderr_path).ok(),
            };
            Outcome::Success(outputs, captured)
        }
        other => other,
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker(
    current_exe: &Path,
    graph_path: &Path,
    job_id: &str,
    historical_path: &Path,
    run_dir: &Path,
    stdout_path: &Path,
    stderr_path: &Path,
    exception_path: &Path,
    result_path: &Path,
) -> std::io::Result<std::process::Child> {
    let mut command = Command::new(current_exe);
    command
        .arg("--internal-run-job")
        .arg(job_id)
        .arg("--graph")
        .arg(graph_path)
        .arg("--run-dir")
        .arg(run_dir)
        .arg("--historical-input")
        .arg(historical_path)
        .arg("--exception-out")
        .arg(exception_path)
        .arg("--result-out")
        .arg(result_path);

    let stdout_file = File::create(stdout_path)?;
    let stderr_file = File::create(stderr_path)?;
    command.stdout(Stdio::from(stdout_file));
    command.stderr(Stdio::from(stderr_file));
    command.stdin(Stdio::null());

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
    }

    command.spawn()
}

fn classify_exit(
    status: &std::process::ExitStatus,
    exception_path: &Path,
    result_path: &Path,
    job: &dyn Job,
    _ctx: &RunContext,
) -> Outcome {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Outcome::Failed(Diagnostic::Died {
                signal: Some(signal),
                detail: format!("job worker for '{}' killed by signal {signal}", job.job_id()),
            });
        }
    }

    match status.code() {
        Some(0) => match read_bincode::<FingerprintMap>(result_path) {
            Ok(outputs) => Outcome::Success(outputs, CapturedOutput::default()),
            Err(e) => Outcome::Failed(Diagnostic::Died {
                signal: None,
                detail: format!("job worker exited 0 but result file was unreadable: {e}"),
            }),
        },
        _ => match read_bincode::<FailureFrame>(exception_path) {
            Ok(frame) => Outcome::Failed(Diagnostic::Job(JobError::Failed(format!(
                "{}: {}",
                frame.kind, frame.message
            )))),
            Err(_) => Outcome::Failed(Diagnostic::Died {
                signal: None,
                detail: format!(
                    "job worker for '{}' exited with no recoverable exception frame",
                    job.job_id()
                ),
            }),
        },
    }
}

pub fn write_bincode<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = bincode::serialize(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut file = File::create(path)?;
    file.write_all(&bytes)
}

pub fn read_bincode<T: serde::de::DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    bincode::deserialize(&bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
