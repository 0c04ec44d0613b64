//! End-to-end scenario tests for the scheduler, run entirely in-process
//! (`Isolation::Disabled`) against real temp directories and a real
//! history file, so each "cold run"/"warm run" pair exercises the whole
//! invalidation pipeline rather than any one component in isolation.

use std::sync::Arc;

use taskforge_core::dag::UserDag;
use taskforge_core::execution::Isolation;
use taskforge_core::job::Job;
use taskforge_core::jobs::{
    FileGeneratingJob, FunctionInvariantJob, ParameterInvariantJob, TempFileGeneratingJob,
};
use taskforge_core::runner::{JobResult, ResultMap, RunConfig, Runner};
use taskforge_core::status::JobState;

fn path_str(dir: &std::path::Path, name: &str) -> String {
    dir.join(name).to_string_lossy().into_owned()
}

fn config(run_dir: &std::path::Path, history_dir: &std::path::Path) -> RunConfig {
    RunConfig {
        run_dir: run_dir.to_path_buf(),
        history_dir: Some(history_dir.to_path_buf()),
        graph_name: "scenario".to_string(),
        cores: 2,
        always_capture_output: false,
        raise_on_job_error: false,
    }
}

fn state_of(results: &ResultMap, job_id: &str) -> JobState {
    results
        .get(job_id)
        .unwrap_or_else(|| panic!("no result recorded for '{job_id}'"))
        .state
}

fn result_of<'a>(results: &'a ResultMap, job_id: &str) -> &'a JobResult {
    results.get(job_id).unwrap_or_else(|| panic!("no result recorded for '{job_id}'"))
}

fn write_job(job_id: &str, path: String, content: impl Into<String>) -> Arc<dyn Job> {
    let content = content.into();
    Arc::new(FileGeneratingJob::new(
        job_id,
        vec![path],
        Arc::new(move |paths| {
            std::fs::write(&paths[0], &content).map_err(|e| e.to_string())
        }),
    ))
}

// S1 -- cold run materializes everything, warm run skips everything with
// output unchanged.
#[test]
fn cold_then_warm_run_builds_once_then_skips() {
    let run_dir = tempfile::tempdir().unwrap();
    let history_dir = tempfile::tempdir().unwrap();
    let a_path = path_str(run_dir.path(), "a");
    let b_path = path_str(run_dir.path(), "b");

    let build = |a_path: String, b_path: String| {
        let a: Arc<dyn Job> = write_job("a", a_path.clone(), "1");
        let b: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
            "b",
            vec![b_path],
            Arc::new(move |paths| {
                let upstream = std::fs::read_to_string(&a_path).map_err(|e| e.to_string())?;
                std::fs::write(&paths[0], format!("{upstream}!")).map_err(|e| e.to_string())
            }),
        ));
        let mut depends_on = std::collections::HashMap::new();
        depends_on.insert("a".to_string(), vec![]);
        depends_on.insert("b".to_string(), vec!["a".to_string()]);
        UserDag { jobs: vec![a, b], depends_on }
    };

    let mut runner = Runner::new(
        build(a_path.clone(), b_path.clone()),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();
    assert_eq!(state_of(&results, "a"), JobState::Success);
    assert_eq!(state_of(&results, "b"), JobState::Success);
    assert_eq!(std::fs::read_to_string(&b_path).unwrap(), "1!");

    let mut runner = Runner::new(
        build(a_path.clone(), b_path.clone()),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();
    assert_eq!(state_of(&results, "a"), JobState::Skipped);
    assert_eq!(state_of(&results, "b"), JobState::Skipped);
    assert_eq!(std::fs::read_to_string(&b_path).unwrap(), "1!");
}

// S2 -- a change upstream (tracked here via an explicit FunctionInvariantJob,
// since a Rust closure's body can't be hashed the way bytecode can) reruns
// every downstream that actually consumes the changed value.
#[test]
fn upstream_change_propagates_through_the_chain() {
    let run_dir = tempfile::tempdir().unwrap();
    let history_dir = tempfile::tempdir().unwrap();
    let a_path = path_str(run_dir.path(), "a");
    let b_path = path_str(run_dir.path(), "b");

    let build = |version: &[u8], a_path: String, b_path: String, a_content: &'static str| {
        let fn_inv: Arc<dyn Job> = Arc::new(FunctionInvariantJob::new("a_fn", version));
        let a: Arc<dyn Job> = write_job("a", a_path.clone(), a_content);
        let b: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
            "b",
            vec![b_path],
            Arc::new(move |paths| {
                let upstream = std::fs::read_to_string(&a_path).map_err(|e| e.to_string())?;
                std::fs::write(&paths[0], format!("{upstream}!")).map_err(|e| e.to_string())
            }),
        ));
        let mut depends_on = std::collections::HashMap::new();
        depends_on.insert("a_fn".to_string(), vec![]);
        depends_on.insert("a".to_string(), vec!["a_fn".to_string()]);
        depends_on.insert("b".to_string(), vec!["a".to_string()]);
        UserDag { jobs: vec![fn_inv, a, b], depends_on }
    };

    let mut runner = Runner::new(
        build(b"v1", a_path.clone(), b_path.clone(), "1"),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    runner.run().unwrap();
    assert_eq!(std::fs::read_to_string(&b_path).unwrap(), "1!");

    let mut runner = Runner::new(
        build(b"v2", a_path.clone(), b_path.clone(), "2"),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();
    assert_eq!(state_of(&results, "a"), JobState::Success);
    assert_eq!(state_of(&results, "b"), JobState::Success);
    assert_eq!(std::fs::read_to_string(&b_path).unwrap(), "2!");
}

// S3 -- a failure cascades to every transitive downstream as UpstreamFailed,
// carrying a diagnostic that names the origin.
#[test]
fn failure_cascades_to_downstreams() {
    let run_dir = tempfile::tempdir().unwrap();
    let history_dir = tempfile::tempdir().unwrap();
    let b_path = path_str(run_dir.path(), "b");

    let a: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
        "a",
        vec![path_str(run_dir.path(), "a")],
        Arc::new(|_paths| Err("x".to_string())),
    ));
    let b: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
        "b",
        vec![b_path],
        Arc::new(|paths| std::fs::write(&paths[0], "unreachable").map_err(|e| e.to_string())),
    ));
    let mut depends_on = std::collections::HashMap::new();
    depends_on.insert("a".to_string(), vec![]);
    depends_on.insert("b".to_string(), vec!["a".to_string()]);

    let mut runner = Runner::new(
        UserDag { jobs: vec![a, b], depends_on },
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();

    assert_eq!(state_of(&results, "a"), JobState::Failed);
    let a_error = result_of(&results, "a").error.as_ref().unwrap().to_string();
    assert!(a_error.contains('x'), "expected captured failure message to contain 'x', got: {a_error}");

    assert_eq!(state_of(&results, "b"), JobState::UpstreamFailed);
    let b_error = result_of(&results, "b").error.as_ref().unwrap().to_string();
    assert!(b_error.contains("'a'"), "expected cascade diagnostic to name 'a', got: {b_error}");
}

// S4 -- a Temp job's materialization is elided when its only consumer's
// output already satisfies its own `output_needed` check.
#[test]
fn temp_job_elided_when_consumer_output_already_satisfied() {
    let run_dir = tempfile::tempdir().unwrap();
    let history_dir = tempfile::tempdir().unwrap();
    let t_path = path_str(run_dir.path(), "t");
    let c_path = path_str(run_dir.path(), "c");

    let build = |t_path: String, c_path: String| {
        let t: Arc<dyn Job> = Arc::new(TempFileGeneratingJob::from_file_generating(
            FileGeneratingJob::new(
                "t",
                vec![t_path.clone()],
                Arc::new(|paths| std::fs::write(&paths[0], "temp").map_err(|e| e.to_string())),
            ),
        ));
        let c: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
            "c",
            vec![c_path],
            Arc::new(move |paths| {
                let upstream = std::fs::read_to_string(&t_path).map_err(|e| e.to_string())?;
                std::fs::write(&paths[0], format!("c:{upstream}")).map_err(|e| e.to_string())
            }),
        ));
        let mut depends_on = std::collections::HashMap::new();
        depends_on.insert("t".to_string(), vec![]);
        depends_on.insert("c".to_string(), vec!["t".to_string()]);
        UserDag { jobs: vec![t, c], depends_on }
    };

    let mut runner = Runner::new(
        build(t_path.clone(), c_path.clone()),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();
    assert_eq!(state_of(&results, "t"), JobState::Success);
    assert_eq!(state_of(&results, "c"), JobState::Success);
    assert_eq!(std::fs::read_to_string(&c_path).unwrap(), "c:temp");

    // The wired-in CleanupJob already removed the temp file once `c`
    // finished during the first run -- only its historical fingerprint
    // survives. Tolerate it already being gone.
    match std::fs::remove_file(&t_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => panic!("unexpected error removing '{t_path}': {e}"),
    }

    let mut runner = Runner::new(
        build(t_path.clone(), c_path.clone()),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();
    assert_eq!(state_of(&results, "t"), JobState::Skipped);
    assert_eq!(state_of(&results, "c"), JobState::Skipped);
    assert!(!std::path::Path::new(&t_path).exists(), "temp job materialized though its consumer was already satisfied");
}

// S5 -- an input renamed but unchanged in content is recognized by the
// rename heuristic, so the consuming job is still skipped.
#[test]
fn rename_with_unchanged_content_is_recognized() {
    let run_dir = tempfile::tempdir().unwrap();
    let history_dir = tempfile::tempdir().unwrap();
    let a_path = path_str(run_dir.path(), "a");
    let a2_path = path_str(run_dir.path(), "a2");
    let b_path = path_str(run_dir.path(), "b");

    let a1: Arc<dyn Job> = write_job("a", a_path.clone(), "hello");
    let b: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
        "b",
        vec![b_path.clone()],
        Arc::new(|paths| std::fs::write(&paths[0], "built").map_err(|e| e.to_string())),
    ));
    let mut depends_on = std::collections::HashMap::new();
    depends_on.insert("a".to_string(), vec![]);
    depends_on.insert("b".to_string(), vec!["a".to_string()]);

    let mut runner = Runner::new(
        UserDag { jobs: vec![a1, b], depends_on: depends_on.clone() },
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    runner.run().unwrap();

    // Same job id, same content, but its declared output name (hence its
    // position in the fingerprint map) has changed.
    let a2: Arc<dyn Job> = write_job("a", a2_path.clone(), "hello");
    let b2: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
        "b",
        vec![b_path.clone()],
        Arc::new(|paths| std::fs::write(&paths[0], "built").map_err(|e| e.to_string())),
    ));
    let mut runner = Runner::new(
        UserDag { jobs: vec![a2, b2], depends_on },
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();
    assert_eq!(state_of(&results, "b"), JobState::Skipped);
}

// S6 -- a parameter invariant's value change reruns its consumer even though
// the consumer's own output already exists on disk.
#[test]
fn parameter_change_reruns_dependent_job() {
    let run_dir = tempfile::tempdir().unwrap();
    let history_dir = tempfile::tempdir().unwrap();
    let b_path = path_str(run_dir.path(), "b");

    let build = |value: i32, b_path: String| {
        let p: Arc<dyn Job> = Arc::new(ParameterInvariantJob::new("p", &value));
        let b: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
            "b",
            vec![b_path],
            Arc::new(move |paths| {
                std::fs::write(&paths[0], value.to_string()).map_err(|e| e.to_string())
            }),
        ));
        let mut depends_on = std::collections::HashMap::new();
        depends_on.insert("p".to_string(), vec![]);
        depends_on.insert("b".to_string(), vec!["p".to_string()]);
        UserDag { jobs: vec![p, b], depends_on }
    };

    let mut runner = Runner::new(
        build(1, b_path.clone()),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();
    assert_eq!(state_of(&results, "b"), JobState::Success);
    assert_eq!(std::fs::read_to_string(&b_path).unwrap(), "1");

    let mut runner = Runner::new(
        build(2, b_path.clone()),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();
    assert_eq!(state_of(&results, "b"), JobState::Success);
    assert_eq!(std::fs::read_to_string(&b_path).unwrap(), "2");
}

// Property: a warm run with zero changes performs zero isolated executions
// of job bodies -- every job ends Skipped, not merely "not observably
// different".
#[test]
fn fully_warm_run_skips_every_job() {
    let run_dir = tempfile::tempdir().unwrap();
    let history_dir = tempfile::tempdir().unwrap();

    let build = |run_dir: &std::path::Path| {
        let a_path = path_str(run_dir, "a");
        let b_path = path_str(run_dir, "b");
        let c_path = path_str(run_dir, "c");
        let a: Arc<dyn Job> = write_job("a", a_path, "1");
        let b: Arc<dyn Job> = write_job("b", b_path, "2");
        let c: Arc<dyn Job> = write_job("c", c_path, "3");
        let mut depends_on = std::collections::HashMap::new();
        depends_on.insert("a".to_string(), vec![]);
        depends_on.insert("b".to_string(), vec!["a".to_string()]);
        depends_on.insert("c".to_string(), vec!["b".to_string()]);
        UserDag { jobs: vec![a, b, c], depends_on }
    };

    let mut runner = Runner::new(
        build(run_dir.path()),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    runner.run().unwrap();

    let mut runner = Runner::new(
        build(run_dir.path()),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();
    for job_id in ["a", "b", "c"] {
        assert_eq!(state_of(&results, job_id), JobState::Skipped);
    }
}

// Regression: a Temp job with two live consumers gets a distinct probe per
// consumer (keyed by the consumer's id), so one consumer's continuing need
// for the temp output isn't masked by the other consumer's probe.
#[test]
fn temp_job_reruns_when_any_live_consumer_still_needs_it() {
    let run_dir = tempfile::tempdir().unwrap();
    let history_dir = tempfile::tempdir().unwrap();
    let t_path = path_str(run_dir.path(), "t");
    let c1_path = path_str(run_dir.path(), "c1");
    let c2_path = path_str(run_dir.path(), "c2");

    let build = |t_path: String, c1_path: String, c2_path: String| {
        let t: Arc<dyn Job> = Arc::new(TempFileGeneratingJob::from_file_generating(
            FileGeneratingJob::new(
                "t",
                vec![t_path.clone()],
                Arc::new(|paths| std::fs::write(&paths[0], "temp").map_err(|e| e.to_string())),
            ),
        ));
        let t_for_c1 = t_path.clone();
        let c1: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
            "c1",
            vec![c1_path],
            Arc::new(move |paths| {
                let upstream = std::fs::read_to_string(&t_for_c1).map_err(|e| e.to_string())?;
                std::fs::write(&paths[0], format!("c1:{upstream}")).map_err(|e| e.to_string())
            }),
        ));
        let t_for_c2 = t_path.clone();
        let c2: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
            "c2",
            vec![c2_path],
            Arc::new(move |paths| {
                let upstream = std::fs::read_to_string(&t_for_c2).map_err(|e| e.to_string())?;
                std::fs::write(&paths[0], format!("c2:{upstream}")).map_err(|e| e.to_string())
            }),
        ));
        let mut depends_on = std::collections::HashMap::new();
        depends_on.insert("t".to_string(), vec![]);
        depends_on.insert("c1".to_string(), vec!["t".to_string()]);
        depends_on.insert("c2".to_string(), vec!["t".to_string()]);
        UserDag { jobs: vec![t, c1, c2], depends_on }
    };

    let mut runner = Runner::new(
        build(t_path.clone(), c1_path.clone(), c2_path.clone()),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();
    assert_eq!(state_of(&results, "t"), JobState::Success);
    assert_eq!(state_of(&results, "c1"), JobState::Success);
    assert_eq!(state_of(&results, "c2"), JobState::Success);
    assert_eq!(std::fs::read_to_string(&c1_path).unwrap(), "c1:temp");
    assert_eq!(std::fs::read_to_string(&c2_path).unwrap(), "c2:temp");

    // Only c1's own output goes missing; c2's is still on disk and matches
    // history, so c2 needs nothing further. t's temp file was already
    // removed by its wired-in CleanupJob once both consumers finished.
    std::fs::remove_file(&c1_path).unwrap();

    let mut runner = Runner::new(
        build(t_path.clone(), c1_path.clone(), c2_path.clone()),
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();

    // t must still materialize for c1's sake even though c2 no longer needs
    // it -- the bug this guards against collapsed both consumers onto a
    // single probe keyed by t's id, so whichever consumer's probe lost the
    // race silently stopped gating t's invalidation.
    assert_eq!(state_of(&results, "t"), JobState::Success);
    assert_eq!(state_of(&results, "c1"), JobState::Success);
    assert_eq!(state_of(&results, "c2"), JobState::Skipped);
    assert_eq!(std::fs::read_to_string(&c1_path).unwrap(), "c1:temp");
}

// CleanupJob: a Temp job's consumer reading its content during its own run,
// then the synthesized cleanup node removing the temp output once that
// consumer reaches a terminal state.
#[test]
fn cleanup_job_removes_temp_output_once_consumer_finishes() {
    let run_dir = tempfile::tempdir().unwrap();
    let history_dir = tempfile::tempdir().unwrap();
    let t_path = path_str(run_dir.path(), "t");
    let c_path = path_str(run_dir.path(), "c");

    let t: Arc<dyn Job> = Arc::new(TempFileGeneratingJob::from_file_generating(
        FileGeneratingJob::new(
            "t",
            vec![t_path.clone()],
            Arc::new(|paths| std::fs::write(&paths[0], "temp").map_err(|e| e.to_string())),
        ),
    ));
    let t_for_c = t_path.clone();
    let c: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
        "c",
        vec![c_path.clone()],
        Arc::new(move |paths| {
            let upstream = std::fs::read_to_string(&t_for_c).map_err(|e| e.to_string())?;
            std::fs::write(&paths[0], format!("c:{upstream}")).map_err(|e| e.to_string())
        }),
    ));
    let mut depends_on = std::collections::HashMap::new();
    depends_on.insert("t".to_string(), vec![]);
    depends_on.insert("c".to_string(), vec!["t".to_string()]);

    let mut runner = Runner::new(
        UserDag { jobs: vec![t, c], depends_on },
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();

    assert_eq!(state_of(&results, "t"), JobState::Success);
    assert_eq!(state_of(&results, "c"), JobState::Success);
    assert_eq!(state_of(&results, "CleanUp:t"), JobState::Success);
    assert_eq!(std::fs::read_to_string(&c_path).unwrap(), "c:temp");
    assert!(
        !std::path::Path::new(&t_path).exists(),
        "CleanUp:t should have removed t's temp output once c finished"
    );
}

// Property: every job in the extended graph reaches a terminal state by the
// time `run` returns, even across an unrelated sibling failure.
#[test]
fn every_job_reaches_a_terminal_state() {
    let run_dir = tempfile::tempdir().unwrap();
    let history_dir = tempfile::tempdir().unwrap();

    let failing: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
        "failing",
        vec![path_str(run_dir.path(), "failing.out")],
        Arc::new(|_paths| Err("boom".to_string())),
    ));
    let downstream: Arc<dyn Job> = Arc::new(FileGeneratingJob::new(
        "downstream",
        vec![path_str(run_dir.path(), "downstream.out")],
        Arc::new(|paths| std::fs::write(&paths[0], "x").map_err(|e| e.to_string())),
    ));
    let sibling: Arc<dyn Job> = write_job("sibling", path_str(run_dir.path(), "sibling.out"), "s");

    let mut depends_on = std::collections::HashMap::new();
    depends_on.insert("failing".to_string(), vec![]);
    depends_on.insert("downstream".to_string(), vec!["failing".to_string()]);
    depends_on.insert("sibling".to_string(), vec![]);

    let mut runner = Runner::new(
        UserDag { jobs: vec![failing, downstream, sibling], depends_on },
        config(run_dir.path(), history_dir.path()),
        Isolation::Disabled,
    )
    .unwrap();
    let results = runner.run().unwrap();

    assert_eq!(state_of(&results, "failing"), JobState::Failed);
    assert_eq!(state_of(&results, "downstream"), JobState::UpstreamFailed);
    assert_eq!(state_of(&results, "sibling"), JobState::Success);
}
