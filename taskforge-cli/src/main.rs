//! Command-line front end (C9): a declarative YAML graph file in, a run
//! report out. Also doubles as the isolated worker entry point that
//! `taskforge_core::execution` re-execs for jobs that want process isolation.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use taskforge_core::config;
use taskforge_core::dag::{self, UserDag};
use taskforge_core::execution::{self, FailureFrame, Isolation};
use taskforge_core::job::{Job, Resources};
use taskforge_core::jobs::{
    FileGeneratingJob, FunctionInvariantJob, LoadingJob, ParameterInvariantJob,
    TempFileGeneratingJob,
};
use taskforge_core::runner::{JobResult, RunContext, Runner};
use taskforge_core::status::JobState;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about = "Incremental, dependency-aware job execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Internal worker entry point: runs a single job's body in isolation
    /// and exits. The parent process re-execs itself with this flag; it is
    /// not meant to be invoked by hand.
    #[arg(long, hide = true)]
    internal_run_job: Option<String>,

    #[arg(long, hide = true)]
    graph: Option<PathBuf>,
    #[arg(long, hide = true)]
    run_dir: Option<PathBuf>,
    #[arg(long, hide = true)]
    historical_input: Option<PathBuf>,
    #[arg(long, hide = true)]
    exception_out: Option<PathBuf>,
    #[arg(long, hide = true)]
    result_out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the job table from a graph file and run it to completion.
    Run {
        graph: PathBuf,
        /// Exit nonzero if any job ends in the Failed state.
        #[arg(long)]
        strict: bool,
    },
    /// Parse and extend a graph file, printing the extended DAG without running anything.
    Show { graph: PathBuf },
    /// Remove a graph's declared outputs and its history file.
    Clean { graph: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(job_id) = cli.internal_run_job.clone() {
        return run_internal_job(&cli, &job_id);
    }

    match cli.command {
        Some(Commands::Run { graph, strict }) => run_graph(&graph, strict),
        Some(Commands::Show { graph }) => show_graph(&graph),
        Some(Commands::Clean { graph }) => clean_graph(&graph),
        None => {
            eprintln!("error: no subcommand given, try `graphrunner run <graph.yml>`");
            ExitCode::FAILURE
        }
    }
}

// ---- graph file schema (§4.9) ------------------------------------------------

#[derive(Debug, Deserialize)]
struct GraphFile {
    #[allow(dead_code)]
    #[serde(rename = "apiVersion")]
    api_version: String,
    #[allow(dead_code)]
    kind: String,
    metadata: Metadata,
    spec: Spec,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Spec {
    jobs: HashMap<String, JobSpec>,
}

#[derive(Debug, Deserialize)]
struct JobSpec {
    kind: String,
    #[serde(default)]
    depends_on: Vec<String>,
    resources: Option<String>,
    command: Option<String>,
    outputs: Option<Vec<String>>,
    value: Option<serde_json::Value>,
    version: Option<String>,
    path: Option<String>,
    output_name: Option<String>,
    #[serde(default)]
    empty_ok: bool,
}

fn load_graph_file(path: &Path) -> anyhow::Result<GraphFile> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("could not read graph file '{}': {e}", path.display()))?;
    let graph: GraphFile = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("could not parse graph file '{}': {e}", path.display()))?;
    Ok(graph)
}

fn parse_resources(spec: &str) -> anyhow::Result<Resources> {
    match spec {
        "single_core" => Ok(Resources::SingleCore),
        "all_cores" => Ok(Resources::AllCores),
        "exclusive" => Ok(Resources::Exclusive),
        "runs_here" => Ok(Resources::RunsHere),
        other => Err(anyhow::anyhow!("unknown resources class '{other}'")),
    }
}

fn build_job(job_id: &str, spec: &JobSpec) -> anyhow::Result<Arc<dyn Job>> {
    let resources = spec.resources.as_deref().map(parse_resources).transpose()?;

    let job: Arc<dyn Job> = match spec.kind.as_str() {
        "file_generating" => {
            let command = spec
                .command
                .clone()
                .ok_or_else(|| anyhow::anyhow!("job '{job_id}': file_generating needs 'command'"))?;
            let outputs = spec
                .outputs
                .clone()
                .ok_or_else(|| anyhow::anyhow!("job '{job_id}': file_generating needs 'outputs'"))?;
            let mut job = FileGeneratingJob::command(job_id, outputs, command).with_empty_ok(spec.empty_ok);
            if let Some(resources) = resources {
                job = job.with_resources(resources);
            }
            Arc::new(job)
        }
        "temp_file_generating" => {
            let command = spec.command.clone().ok_or_else(|| {
                anyhow::anyhow!("job '{job_id}': temp_file_generating needs 'command'")
            })?;
            let outputs = spec.outputs.clone().ok_or_else(|| {
                anyhow::anyhow!("job '{job_id}': temp_file_generating needs 'outputs'")
            })?;
            let mut inner =
                FileGeneratingJob::command(job_id, outputs, command).with_empty_ok(spec.empty_ok);
            if let Some(resources) = resources {
                inner = inner.with_resources(resources);
            }
            Arc::new(TempFileGeneratingJob::from_file_generating(inner))
        }
        "parameter_invariant" => {
            let value = spec
                .value
                .clone()
                .ok_or_else(|| anyhow::anyhow!("job '{job_id}': parameter_invariant needs 'value'"))?;
            Arc::new(ParameterInvariantJob::new(job_id, &value))
        }
        "function_invariant" => {
            let version = spec
                .version
                .clone()
                .ok_or_else(|| anyhow::anyhow!("job '{job_id}': function_invariant needs 'version'"))?;
            Arc::new(FunctionInvariantJob::new(job_id, version.as_bytes()))
        }
        "loading" => {
            let path = spec
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("job '{job_id}': loading needs 'path'"))?;
            let output_name = spec.output_name.clone().unwrap_or_else(|| job_id.to_string());
            Arc::new(LoadingJob::new(job_id, output_name, PathBuf::from(path)))
        }
        other => return Err(anyhow::anyhow!("job '{job_id}': unknown kind '{other}'")),
    };
    Ok(job)
}

fn build_user_dag(graph: &GraphFile) -> anyhow::Result<UserDag> {
    let mut jobs = Vec::with_capacity(graph.spec.jobs.len());
    let mut depends_on = HashMap::with_capacity(graph.spec.jobs.len());
    for (job_id, spec) in &graph.spec.jobs {
        jobs.push(build_job(job_id, spec)?);
        depends_on.insert(job_id.clone(), spec.depends_on.clone());
    }
    Ok(UserDag { jobs, depends_on })
}

fn history_dir_for(graph: &GraphFile) -> PathBuf {
    PathBuf::from(".graphrunner").join(&graph.metadata.name)
}

// ---- `run` ------------------------------------------------------------------

fn run_graph(graph_path: &Path, strict: bool) -> ExitCode {
    let graph = match load_graph_file(graph_path) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let user_dag = match build_user_dag(&graph) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let history_dir = history_dir_for(&graph);
    let mut run_config = config::load(Path::new(".graphrc.toml"), &graph.metadata.name);
    run_config.history_dir = Some(history_dir);
    run_config.raise_on_job_error = strict || run_config.raise_on_job_error;

    let current_exe = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("could not resolve current executable: {e}");
            return ExitCode::FAILURE;
        }
    };
    let isolation = Isolation::ChildProcess {
        current_exe,
        graph_path: graph_path.to_path_buf(),
        run_dir: run_config.run_dir.clone(),
    };

    let mut runner = match Runner::new(user_dag, run_config, isolation) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let interrupted = runner.interrupt_handle();
    let _ = ctrlc::set_handler(move || {
        interrupted.store(true, Ordering::Relaxed);
    });

    match runner.run() {
        Ok(results) => {
            print_status_table(&results);
            if results.values().any(|r| r.state == JobState::Failed) {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn print_status_table(results: &HashMap<String, JobResult>) {
    let mut ids: Vec<&String> = results.keys().collect();
    ids.sort();
    for job_id in ids {
        let result = &results[job_id];
        let state = match result.state {
            JobState::Success => "Success",
            JobState::Failed => "Failed",
            JobState::UpstreamFailed => "UpstreamFailed",
            JobState::Skipped => "Skipped",
            JobState::Waiting => "Waiting",
            JobState::ReadyToRun => "ReadyToRun",
        };
        match &result.error {
            Some(err) => println!("{job_id}: {state} ({err})"),
            None => println!("{job_id}: {state}"),
        }
    }
}

// ---- `show` ------------------------------------------------------------------

fn show_graph(graph_path: &Path) -> ExitCode {
    let graph = match load_graph_file(graph_path) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let user_dag = match build_user_dag(&graph) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let extended = match dag::extend(user_dag) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut ids: Vec<&String> = extended.jobs.keys().collect();
    ids.sort();
    for job_id in ids {
        let kind = extended.jobs[job_id].kind();
        let upstreams = extended.direct_upstreams(job_id);
        println!("{job_id} [{kind:?}] depends_on {upstreams:?}");
    }
    ExitCode::SUCCESS
}

// ---- `clean` ------------------------------------------------------------------

fn clean_graph(graph_path: &Path) -> ExitCode {
    let graph = match load_graph_file(graph_path) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    for (job_id, spec) in &graph.spec.jobs {
        if let Some(outputs) = &spec.outputs {
            for output in outputs {
                match std::fs::remove_file(output) {
                    Ok(()) => println!("removed {output}"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => eprintln!("job '{job_id}': could not remove '{output}': {e}"),
                }
            }
        }
    }

    let history_dir = history_dir_for(&graph);
    let history_path = taskforge_core::history::history_file_path(&history_dir, &graph.metadata.name);
    match std::fs::remove_file(&history_path) {
        Ok(()) => println!("removed {}", history_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => eprintln!("could not remove history file '{}': {e}", history_path.display()),
    }

    ExitCode::SUCCESS
}

// ---- `--internal-run-job` worker entry point -----------------------------

fn run_internal_job(cli: &Cli, job_id: &str) -> ExitCode {
    let (graph_path, run_dir, historical_input, exception_out, result_out) = match (
        &cli.graph,
        &cli.run_dir,
        &cli.historical_input,
        &cli.exception_out,
        &cli.result_out,
    ) {
        (Some(g), Some(r), Some(h), Some(e), Some(o)) => (g, r, h, e, o),
        _ => {
            eprintln!(
                "--internal-run-job requires --graph, --run-dir, --historical-input, --exception-out and --result-out"
            );
            return ExitCode::FAILURE;
        }
    };

    let graph = match load_graph_file(graph_path) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let user_dag = match build_user_dag(&graph) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let extended = match dag::extend(user_dag) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let Some(job) = extended.jobs.get(job_id).cloned() else {
        eprintln!("unknown job id '{job_id}'");
        return ExitCode::FAILURE;
    };

    let historical_output = execution::read_bincode(historical_input).unwrap_or_default();
    let ctx = RunContext::standalone(extended, run_dir.clone());

    match job.run(&ctx, &historical_output) {
        Ok(outputs) => match execution::write_bincode(result_out, &outputs) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("could not write result file: {e}");
                ExitCode::FAILURE
            }
        },
        Err(job_error) => {
            let frame = FailureFrame::from(&job_error);
            if let Err(e) = execution::write_bincode(exception_out, &frame) {
                eprintln!("could not write exception file: {e}");
            }
            ExitCode::FAILURE
        }
    }
}
