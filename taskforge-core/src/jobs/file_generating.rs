//! `FileGeneratingJob` (§4.8): the ordinary output-producing job. Backed
//! either by a Rust closure (tests, library embedding) or by a shell command
//! string (the CLI's declarative graph file).

use crate::error::JobError;
use crate::fingerprint::{Fingerprint, FingerprintMap, ProbeResult};
use crate::job::{Job, JobKind, Resources};
use crate::runner::RunContext;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

/// A job body supplied in-process. Takes the declared output paths and
/// writes them; any `Err` becomes `JobError::Failed`.
pub type GenerateFn = Arc<dyn Fn(&[PathBuf]) -> Result<(), String> + Send + Sync>;

enum Body {
    Closure(GenerateFn),
    Command(String),
}

pub struct FileGeneratingJob {
    job_id: String,
    outputs: Vec<String>,
    resources: Resources,
    empty_ok: bool,
    body: Body,
}

impl fmt::Debug for FileGeneratingJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            Body::Closure(_) => "Closure",
            Body::Command(cmd) => cmd.as_str(),
        };
        f.debug_struct("FileGeneratingJob")
            .field("job_id", &self.job_id)
            .field("outputs", &self.outputs)
            .field("body", &body)
            .finish()
    }
}

impl FileGeneratingJob {
    pub fn new(job_id: impl Into<String>, outputs: Vec<String>, body: GenerateFn) -> Self {
        FileGeneratingJob {
            job_id: job_id.into(),
            outputs,
            resources: Resources::SingleCore,
            empty_ok: false,
            body: Body::Closure(body),
        }
    }

    pub fn command(job_id: impl Into<String>, outputs: Vec<String>, command: impl Into<String>) -> Self {
        FileGeneratingJob {
            job_id: job_id.into(),
            outputs,
            resources: Resources::SingleCore,
            empty_ok: false,
            body: Body::Command(command.into()),
        }
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_empty_ok(mut self, empty_ok: bool) -> Self {
        self.empty_ok = empty_ok;
        self
    }
}

/// `true` iff `path` is missing, or present but zero-length with
/// `empty_ok=false` (§9 Open Question: absence of an explicit "not needed"
/// verdict is resolved as "needed").
pub(crate) fn path_needs_refresh(path: &std::path::Path, empty_ok: bool) -> bool {
    match fs::metadata(path) {
        Ok(meta) => !empty_ok && meta.len() == 0,
        Err(_) => true,
    }
}

pub(crate) fn fingerprint_path(path: &std::path::Path) -> Result<Fingerprint, JobError> {
    let meta = fs::metadata(path)
        .map_err(|e| JobError::OutputMissing(format!("{}: {e}", path.display())))?;
    let contents = fs::read(path)
        .map_err(|e| JobError::OutputMissing(format!("{}: {e}", path.display())))?;
    let hash = blake3::hash(&contents).to_hex().to_string();
    let mtime_secs = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(Fingerprint::File {
        hash,
        size: meta.len(),
        mtime_secs,
    })
}

impl Job for FileGeneratingJob {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn kind(&self) -> JobKind {
        JobKind::Output
    }

    fn resources(&self) -> Resources {
        self.resources
    }

    fn output_needed(&self, _ctx: &RunContext) -> bool {
        self.outputs
            .iter()
            .any(|p| path_needs_refresh(std::path::Path::new(p), self.empty_ok))
    }

    fn compare_hashes(&self, old: &Fingerprint, new: &Fingerprint) -> bool {
        match (old, new) {
            (Fingerprint::File { hash: h1, .. }, Fingerprint::File { hash: h2, .. }) => h1 == h2,
            _ => old == new,
        }
    }

    fn run(
        &self,
        _ctx: &RunContext,
        _historical_output: &FingerprintMap,
    ) -> Result<FingerprintMap, JobError> {
        for name in &self.outputs {
            match fs::remove_file(name) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(JobError::Failed(format!(
                        "could not remove stale output '{name}': {e}"
                    )))
                }
            }
        }

        match &self.body {
            Body::Closure(f) => {
                let paths: Vec<PathBuf> = self.outputs.iter().map(PathBuf::from).collect();
                f(&paths).map_err(JobError::Failed)?;
            }
            Body::Command(command) => {
                let status = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .status()
                    .map_err(|e| JobError::Died(format!("failed to spawn '{command}': {e}")))?;
                if !status.success() {
                    return Err(JobError::Failed(format!(
                        "command '{command}' exited with {status}"
                    )));
                }
            }
        }

        let mut outputs = FingerprintMap::new();
        for name in &self.outputs {
            let path = std::path::Path::new(name);
            if !path.exists() {
                return Err(JobError::OutputMissing(name.clone()));
            }
            let fp = fingerprint_path(path)?;
            if let Fingerprint::File { size, .. } = &fp {
                if *size == 0 && !self.empty_ok {
                    return Err(JobError::EmptyOutputForbidden(name.clone()));
                }
            }
            outputs.insert(name.clone(), ProbeResult::Value(fp));
        }
        Ok(outputs)
    }
}
