//! Layered configuration (§4.9): built-in defaults, optionally overridden by
//! a `.graphrc.toml`, then by `GRAPHRUNNER_*` environment variables, then by
//! whatever the CLI flags resolved to (applied by the caller last).

use crate::runner::RunConfig;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    history_dir: Option<PathBuf>,
    cores: Option<usize>,
    always_capture_output: Option<bool>,
    run_mode: Option<String>,
}

/// Builds a [`RunConfig`] from built-in defaults, `<config_path>` (if it
/// exists), and `GRAPHRUNNER_*` environment variables, in that precedence
/// order. `graph_name` seeds the history file name and is not itself
/// configurable here.
pub fn load(config_path: &Path, graph_name: &str) -> RunConfig {
    let mut config = RunConfig {
        graph_name: graph_name.to_string(),
        ..RunConfig::default()
    };

    if let Ok(contents) = std::fs::read_to_string(config_path) {
        if let Ok(file_config) = toml::from_str::<FileConfig>(&contents) {
            apply_file_config(&mut config, file_config);
        }
    }

    apply_env(&mut config);
    config
}

fn apply_file_config(config: &mut RunConfig, file: FileConfig) {
    if let Some(history_dir) = file.history_dir {
        config.history_dir = Some(history_dir);
    }
    if let Some(cores) = file.cores {
        config.cores = cores;
    }
    if let Some(always_capture_output) = file.always_capture_output {
        config.always_capture_output = always_capture_output;
    }
    if let Some(run_mode) = file.run_mode {
        config.raise_on_job_error = run_mode.eq_ignore_ascii_case("strict");
    }
}

fn apply_env(config: &mut RunConfig) {
    if let Ok(value) = env::var("GRAPHRUNNER_HISTORY_DIR") {
        config.history_dir = Some(PathBuf::from(value));
    }
    if let Ok(value) = env::var("GRAPHRUNNER_CORES") {
        if let Ok(cores) = value.parse::<usize>() {
            config.cores = cores;
        }
    }
    if let Ok(value) = env::var("GRAPHRUNNER_ALWAYS_CAPTURE_OUTPUT") {
        if let Ok(flag) = value.parse::<bool>() {
            config.always_capture_output = flag;
        }
    }
    if let Ok(value) = env::var("GRAPHRUNNER_RUN_MODE") {
        config.raise_on_job_error = value.eq_ignore_ascii_case("strict");
    }
}
