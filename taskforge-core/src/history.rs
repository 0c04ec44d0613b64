//! History Store (C1, §4.1, §6.1): the per-job `(input, output)` fingerprint
//! record that survives between runs.

use crate::fingerprint::FingerprintMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobHistoryRecord {
    pub input: FingerprintMap,
    pub output: FingerprintMap,
}

pub type History = HashMap<String, JobHistoryRecord>;

pub fn history_file_path(history_dir: &Path, graph_name: &str) -> PathBuf {
    history_dir.join(format!("graphrunner_status_{graph_name}"))
}

/// Loads a history file, tolerating a missing file (fresh/stateless run)
/// and a truncated trailing record (a crash mid-write before the previous
/// save's rename completed is not possible thanks to the atomic rename, but
/// a record written by a killed process before that point might still be
/// short; we stop there rather than erroring).
pub fn load(path: &Path) -> io::Result<History> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(History::new()),
        Err(e) => return Err(e),
    };

    let mut history = History::new();
    loop {
        let mut len_buf = [0u8; 8];
        match read_exact_or_eof(&mut file, &mut len_buf)? {
            false => break,
            true => {}
        }
        let len = u64::from_le_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        if !read_exact_or_eof(&mut file, &mut payload)? {
            break; // truncated trailing record
        }

        match bincode::deserialize::<(String, JobHistoryRecord)>(&payload) {
            Ok((job_id, record)) => {
                history.insert(job_id, record);
            }
            Err(_) => break, // corrupt trailing record, stop rather than error
        }
    }

    Ok(history)
}

/// Reads exactly `buf.len()` bytes, returning `Ok(false)` if the stream is
/// already at EOF before any byte is read, and propagating a genuine I/O
/// error otherwise. A short read partway through is treated the same as a
/// clean EOF (truncated trailing record).
fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..]) {
            Ok(0) => return Ok(false), // EOF, whether clean or mid-record
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Rewrites the whole history file via a temp file plus atomic rename, so a
/// crash mid-write leaves the previous history intact.
pub fn save(path: &Path, history: &History) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("history")
    ));

    {
        let mut tmp = File::create(&tmp_path)?;
        for (job_id, record) in history {
            let payload = bincode::serialize(&(job_id.clone(), record.clone()))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            tmp.write_all(&(payload.len() as u64).to_le_bytes())?;
            tmp.write_all(&payload)?;
        }
        tmp.flush()?;
    }

    fs::rename(&tmp_path, path)
}
