//! CLI tests for the `dagrun` binary.
//!
//! Spawns the binary against a temp directory and checks JSON output, exit
//! codes and what lands in `.dagrun/`.

use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

use dagrun::claim::claim;
use dagrun::exit_codes;
use dagrun::io::events::{EventKind, read_events};
use dagrun::io::paths::{InitOptions, init_dag};
use dagrun::io::store::FileStore;

fn dagrun(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dagrun"))
        .arg("--dir")
        .arg(dir)
        .args(args)
        .env_remove("DAGRUN_DIR")
        .env_remove("DAGRUN_RUN_ID")
        .output()
        .expect("spawn dagrun")
}

fn json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not JSON ({err}): {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn ok(dir: &Path, args: &[&str]) -> Value {
    let output = dagrun(dir, args);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "dagrun {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    json(&output)
}

fn ready_ids(dir: &Path, root: &str) -> Vec<String> {
    ok(dir, &["ready", "--root", root])
        .as_array()
        .expect("array")
        .iter()
        .map(|node| node["id"].as_str().expect("id").to_string())
        .collect()
}

/// `R` with children `A` and `B`, `A` blocking `B`, both execute-routed.
fn seed_blocked_pair(dir: &Path) {
    ok(dir, &["create", "--id", "R", "--title", "root"]);
    for id in ["A", "B"] {
        ok(
            dir,
            &["create", "--id", id, "--title", id, "--parent", "R", "--spec-role", "worker"],
        );
    }
    let edge = ok(dir, &["edge", "add", "A", "blocks", "B"]);
    assert_eq!(edge["changed"], true);
}

#[test]
fn init_refuses_to_clobber_without_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    ok(temp.path(), &["init"]);
    let again = dagrun(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&again.stderr).contains("--force"));
    ok(temp.path(), &["init", "--force"]);
}

#[test]
fn commands_require_init() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = dagrun(temp.path(), &["ready"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("dagrun init"));
}

#[test]
fn create_wires_parent_and_execution_spec() {
    let temp = tempfile::tempdir().expect("tempdir");
    ok(temp.path(), &["init"]);
    ok(temp.path(), &["create", "--id", "R", "--title", "root"]);
    let node = ok(
        temp.path(),
        &[
            "create",
            "--title",
            "leaf",
            "--parent",
            "R",
            "--spec",
            r#"{"cmd": "make"}"#,
            "--priority",
            "1",
        ],
    );
    let id = node["id"].as_str().expect("id");
    assert!(id.starts_with("iss-"), "{id}");
    assert_eq!(node["execution_spec"]["payload"]["cmd"], "make");
    assert_eq!(node["priority"], 1);

    let shown = ok(temp.path(), &["show", "R"]);
    assert_eq!(shown["children"][0], id);

    let missing = dagrun(temp.path(), &["show", "nope"]);
    assert_eq!(missing.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&missing.stderr).contains("node not found: nope"));
}

#[test]
fn control_node_without_policy_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    ok(temp.path(), &["init"]);
    let output = dagrun(temp.path(), &["create", "--title", "gate", "--kind", "control"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let node = ok(
        temp.path(),
        &["create", "--title", "gate", "--kind", "control", "--policy", "fallback"],
    );
    assert_eq!(node["policy"], "fallback");
}

#[test]
fn closing_a_blocker_releases_its_sibling() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_dag(temp.path(), &InitOptions { force: false }).expect("init");
    seed_blocked_pair(temp.path());
    assert_eq!(ready_ids(temp.path(), "R"), vec!["A"]);

    let closed = ok(temp.path(), &["close", "A", "--outcome", "success"]);
    assert_eq!(closed["status"], "closed");
    assert_eq!(ready_ids(temp.path(), "R"), vec!["B"]);

    let events = read_events(&paths.events_path).expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Result);
    assert_eq!(events[0].payload["route"], "manual");

    let rejected = dagrun(temp.path(), &["close", "B", "--outcome", "expanded"]);
    assert_eq!(rejected.status.code(), Some(exit_codes::INVALID));

    let reopened = ok(temp.path(), &["reopen", "A", "--reorchestrate"]);
    assert_eq!(reopened["status"], "open");
    assert!(reopened.get("execution_spec").is_none());
}

#[test]
fn edge_rm_and_aliases() {
    let temp = tempfile::tempdir().expect("tempdir");
    ok(temp.path(), &["init"]);
    seed_blocked_pair(temp.path());
    let removed = ok(temp.path(), &["edge", "rm", "B", "blocked_by", "A"]);
    assert_eq!(removed["changed"], true);
    assert_eq!(removed["edge"]["src"], "A");
    let mut ready = ready_ids(temp.path(), "R");
    ready.sort();
    assert_eq!(ready, vec!["A", "B"]);

    let bad = dagrun(temp.path(), &["edge", "add", "A", "owns", "B"]);
    assert_eq!(bad.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn validate_exit_codes() {
    let temp = tempfile::tempdir().expect("tempdir");
    ok(temp.path(), &["init"]);
    seed_blocked_pair(temp.path());
    let report = ok(temp.path(), &["validate", "R"]);
    assert_eq!(report["errors"], Value::Array(Vec::new()));

    let missing = dagrun(temp.path(), &["validate", "ghost"]);
    assert_eq!(missing.status.code(), Some(exit_codes::VALIDATION_FAILED));
    assert_eq!(json(&missing)["errors"][0]["code"], "root_not_found");
}

#[test]
fn reconcile_collapses_finished_parent() {
    let temp = tempfile::tempdir().expect("tempdir");
    ok(temp.path(), &["init"]);
    ok(
        temp.path(),
        &["create", "--id", "S", "--title", "pick", "--kind", "control", "--policy", "fallback"],
    );
    for id in ["x", "y"] {
        ok(
            temp.path(),
            &["create", "--id", id, "--title", id, "--parent", "S", "--spec-role", "worker"],
        );
    }
    ok(temp.path(), &["close", "x", "--outcome", "success"]);

    let decisions = ok(temp.path(), &["reconcile", "S"]);
    assert_eq!(decisions[0]["id"], "S");
    assert_eq!(decisions[0]["policy"], "fallback");
    assert_eq!(decisions[0]["pruned"][0], "y");
    let shown = ok(temp.path(), &["show", "y"]);
    assert_eq!(shown["node"]["status"], "duplicate");
}

#[test]
fn reset_returns_abandoned_claims_to_open() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_dag(temp.path(), &InitOptions { force: false }).expect("init");
    seed_blocked_pair(temp.path());
    let store = FileStore::open(temp.path()).expect("open store");
    claim(&store, "A", Some("crashed")).expect("claim");
    assert!(ready_ids(temp.path(), "R").is_empty());

    let reset = ok(temp.path(), &["reset", "R"]);
    assert_eq!(reset["reset"], serde_json::json!(["A"]));
    assert_eq!(ready_ids(temp.path(), "R"), vec!["A"]);
    let events = read_events(&paths.events_path).expect("events");
    let last = events.last().expect("reopen event");
    assert_eq!(last.kind, EventKind::Reopen);
    assert_eq!(last.payload["reason"], "reset_in_progress");
}

#[cfg(unix)]
mod run {
    use super::*;
    use dagrun::io::config::{DagConfig, write_config};
    use dagrun::io::paths::DagPaths;

    /// Executor script: decompose-routed nodes expand themselves through
    /// `dagrun expand`, execute-routed nodes succeed.
    const SCRIPT: &str = r#"cat >/dev/null
if [ "$DAGRUN_ROUTE" = decompose ]; then
  "$DAGRUN_BIN" expand "$DAGRUN_ISSUE_ID" --children '[{"title":"leaf","execution_spec":{"role":"worker"}}]' >/dev/null || exit 1
  echo '{"outcome":"expanded","provenance":"split via cli"}'
else
  echo "working on $DAGRUN_ISSUE_ID" >&2
  echo '{"outcome":"success","provenance":"did it"}'
fi
"#;

    fn configure(dir: &Path) -> DagPaths {
        let paths = init_dag(dir, &InitOptions { force: false }).expect("init");
        let mut cfg = DagConfig::default();
        cfg.executor.command = vec!["sh".into(), "-c".into(), SCRIPT.into()];
        cfg.executor.timeout_secs = 30;
        write_config(&paths.config_path, &cfg).expect("config");
        paths
    }

    fn run(dir: &Path, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_dagrun"))
            .arg("--dir")
            .arg(dir)
            .arg("run")
            .args(args)
            .env("DAGRUN_BIN", env!("CARGO_BIN_EXE_dagrun"))
            .env_remove("DAGRUN_DIR")
            .env_remove("DAGRUN_RUN_ID")
            .output()
            .expect("spawn dagrun run")
    }

    #[test]
    fn run_decomposes_through_cli_and_finishes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = configure(temp.path());
        ok(temp.path(), &["create", "--id", "R", "--title", "goal"]);

        let output = run(temp.path(), &["R"]);
        assert_eq!(
            output.status.code(),
            Some(exit_codes::OK),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let report = json(&output);
        assert_eq!(report["stop_reason"], "root_final");
        assert_eq!(report["steps"].as_array().expect("steps").len(), 2);
        assert_eq!(report["steps"][0]["route"], "decompose");
        assert_eq!(report["steps"][1]["route"], "execute");

        let run_id = report["run_id"].as_str().expect("run id");
        assert!(paths.run_report_path(run_id).is_file());
        let events = read_events(&paths.events_path).expect("events");
        let expansion = events
            .iter()
            .find(|event| event.kind == EventKind::Expansion)
            .expect("expansion event");
        assert_eq!(expansion.run_id.as_deref(), Some(run_id));
        assert_eq!(
            events
                .iter()
                .filter(|event| event.kind == EventKind::Expansion)
                .count(),
            1
        );
        assert_eq!(ok(temp.path(), &["show", "R"])["node"]["outcome"], "success");
    }

    #[test]
    fn run_out_of_steps_is_not_final() {
        let temp = tempfile::tempdir().expect("tempdir");
        configure(temp.path());
        ok(temp.path(), &["create", "--id", "R", "--title", "goal"]);
        let output = run(temp.path(), &["R", "--max-steps", "1"]);
        assert_eq!(output.status.code(), Some(exit_codes::NOT_FINAL));
        assert_eq!(json(&output)["stop_reason"], "max_steps_exhausted");
    }

    #[test]
    fn run_unknown_root_is_invalid() {
        let temp = tempfile::tempdir().expect("tempdir");
        configure(temp.path());
        let output = run(temp.path(), &["ghost"]);
        assert_eq!(output.status.code(), Some(exit_codes::INVALID));
        assert!(String::from_utf8_lossy(&output.stderr).contains("node not found: ghost"));
    }

    #[test]
    fn failing_executor_is_a_run_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_dag(temp.path(), &InitOptions { force: false }).expect("init");
        let mut cfg = DagConfig::default();
        cfg.executor.command = vec!["sh".into(), "-c".into(), "echo boom >&2; exit 7".into()];
        write_config(&paths.config_path, &cfg).expect("config");
        ok(temp.path(), &["create", "--id", "R", "--title", "goal"]);

        let output = run(temp.path(), &["R"]);
        assert_eq!(output.status.code(), Some(exit_codes::RUN_ERROR));
        let report = json(&output);
        assert_eq!(report["stop_reason"], "error");
        let message = report["error"]["message"].as_str().expect("message");
        assert!(message.contains("exited with status 7"), "{message}");
    }
}
