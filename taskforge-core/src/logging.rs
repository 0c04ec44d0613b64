//! A simple file-based run logger (§4.9), one log file per run under
//! `<history_dir>/logs/`. Deliberately plain and greppable rather than
//! routed through `log`/`tracing`, mirroring the ambient stack's own
//! debug-logging convention.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

fn log_path(history_dir: &Path, graph_name: &str) -> io::Result<std::path::PathBuf> {
    let log_dir = history_dir.join("logs");
    fs::create_dir_all(&log_dir)?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    Ok(log_dir.join(format!("run-{graph_name}-{timestamp}.log")))
}

pub struct RunLogger {
    file: File,
}

impl RunLogger {
    pub fn new(history_dir: &Path, graph_name: &str) -> io::Result<Self> {
        let path = log_path(history_dir, graph_name)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(RunLogger { file })
    }

    pub fn log(&mut self, message: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(self.file, "[{timestamp}] {message}");
    }

    pub fn event(&mut self, direction: &str, description: &str) {
        self.log(&format!("queue {direction}: {description}"));
    }

    pub fn job_started(&mut self, job_id: &str) {
        self.log(&format!("job '{job_id}' started"));
    }

    pub fn job_finished(&mut self, job_id: &str, outcome: &str, duration_secs: Option<f64>) {
        match duration_secs {
            Some(secs) => self.log(&format!("job '{job_id}' {outcome} after {secs:.3}s")),
            None => self.log(&format!("job '{job_id}' {outcome}")),
        }
    }
}
