//! Loop-level tests for full run lifecycles against the file-backed store.
//!
//! These drive `run_loop` end to end: selection across `blocks` edges,
//! claims, routing, reconciliation and the termination gate.

use std::sync::Mutex;

use dagrun::core::index::DependencyIndex;
use dagrun::core::reconcile::{FlowPolicy, PruneReason, Verdict};
use dagrun::core::selector::ready_leaves;
use dagrun::core::termination::TerminationReason;
use dagrun::core::types::{
    ChildSpec, ControlPolicy, Edge, EdgeKind, ExecutionSpec, Node, NodeDraft, Outcome, Status,
    TerminalResult,
};
use dagrun::io::events::EventKind;
use dagrun::io::review::{AcceptAll, Reviewer};
use dagrun::io::store::{FileStore, GraphStore};
use dagrun::looping::{RunConfig, StopReason, run_loop};
use dagrun::test_support::{NOW, ScriptedExecutor, ScriptedReviewer, temp_store};

fn worker(title: &str) -> NodeDraft {
    NodeDraft {
        execution_spec: Some(ExecutionSpec::default()),
        ..NodeDraft::agent(title)
    }
}

fn ready_ids<S: GraphStore>(store: &S, root: &str) -> Vec<String> {
    let graph = store.snapshot().expect("snapshot");
    let index = DependencyIndex::build(&graph);
    ready_leaves(&graph, &index, Some(root))
        .into_iter()
        .map(|node| node.id.clone())
        .collect()
}

/// Root `R` already expanded into `A` and `B`, with `A` blocking `B`.
///
/// ```text
/// R (closed/expanded)
/// ├── A
/// └── B   (blocked by A)
/// ```
///
/// 1. Only `A` is selectable while it is unresolved.
/// 2. Step 1 runs `A`; step 2 runs `B`.
/// 3. Closing `B` collapses `R` to success and the gate reports final.
#[test]
fn blocked_sibling_runs_after_blocker_and_root_collapses() {
    let (_temp, store) = temp_store();
    store
        .update(|graph| {
            graph.insert("R".to_string(), NodeDraft::agent("R"), NOW)?;
            graph.insert("A".to_string(), worker("A"), NOW)?;
            graph.insert("B".to_string(), worker("B"), NOW)?;
            graph.add_edge(Edge::new("A", EdgeKind::Parent, "R"), NOW)?;
            graph.add_edge(Edge::new("B", EdgeKind::Parent, "R"), NOW)?;
            graph.add_edge(Edge::new("A", EdgeKind::Blocks, "B"), NOW)?;
            let root = graph.node_mut("R")?;
            root.status = Status::Closed;
            root.outcome = Outcome::Expanded;
            Ok(())
        })
        .expect("seed graph");
    assert_eq!(ready_ids(&store, "R"), vec!["A"]);

    let executor = ScriptedExecutor::new()
        .on("A", TerminalResult::outcome(Outcome::Success, "a done"))
        .on("B", TerminalResult::outcome(Outcome::Success, "b done"));
    let mut ready_after_first = Vec::new();
    let report = run_loop(
        &store,
        &executor,
        &AcceptAll,
        "R",
        &RunConfig::default(),
        "run-1",
        |step| {
            if step.step == 1 {
                ready_after_first = ready_ids(&store, "R");
            }
        },
    )
    .expect("run");

    assert_eq!(executor.calls(), vec!["A", "B"]);
    assert_eq!(ready_after_first, vec!["B"]);
    assert_eq!(report.stop_reason, StopReason::RootFinal);
    assert_eq!(report.termination.reason, TerminationReason::RootFinalOutcome);
    assert!(report.steps[0].reconcile.is_empty());
    assert_eq!(report.steps[1].reconcile[0].policy, FlowPolicy::Collapse);
    assert_eq!(
        report.steps[1].termination_before,
        TerminationReason::ExpandedNonFinal
    );

    let graph = store.snapshot().expect("snapshot");
    let root = graph.node("R").expect("R");
    assert_eq!((root.status, root.outcome), (Status::Closed, Outcome::Success));

    let kinds: Vec<EventKind> = store
        .events()
        .expect("events")
        .iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Claim,
            EventKind::Result,
            EventKind::Claim,
            EventKind::Result,
            EventKind::Reconcile,
        ]
    );
    assert!(
        store
            .events()
            .expect("events")
            .iter()
            .all(|event| event.run_id.as_deref() == Some("run-1"))
    );
}

/// A fresh root is decomposed by the executor, then its children run in
/// the order their `blocked_by` wiring demands.
#[test]
fn decomposition_builds_and_completes_a_chain() {
    let (_temp, store) = temp_store();
    store
        .update(|graph| {
            graph.insert("goal".to_string(), NodeDraft::agent("ship it"), NOW)?;
            Ok(())
        })
        .expect("seed");
    let plan = ChildSpec::chain(vec![
        ChildSpec::new(worker("design")),
        ChildSpec::new(worker("build")),
        ChildSpec::new(worker("release")),
    ]);
    let executor = ScriptedExecutor::new()
        .on("goal", TerminalResult::expand(plan, "three phases"))
        .on("design", TerminalResult::outcome(Outcome::Success, ""))
        .on("build", TerminalResult::outcome(Outcome::Skipped, "already built"))
        .on("release", TerminalResult::outcome(Outcome::Success, ""));

    let report = run_loop(
        &store,
        &executor,
        &AcceptAll,
        "goal",
        &RunConfig::default(),
        "run-2",
        |_| {},
    )
    .expect("run");

    assert_eq!(report.stop_reason, StopReason::RootFinal);
    assert_eq!(report.steps.len(), 4);
    assert_eq!(report.steps[0].children.len(), 3);
    let graph = store.snapshot().expect("snapshot");
    let titles: Vec<&str> = report.steps[1..]
        .iter()
        .map(|step| graph.node(&step.selected).expect("node").title.as_str())
        .collect();
    assert_eq!(titles, vec!["design", "build", "release"]);
    assert_eq!(graph.node("goal").expect("goal").outcome, Outcome::Success);
    assert!(report.final_validation.is_ok());
}

/// A failed child under a sequence control node prunes the rest of the
/// sequence and fails the parent.
#[test]
fn sequence_failure_prunes_remaining_children() {
    let (_temp, store) = temp_store();
    store
        .update(|graph| {
            graph.insert("root".to_string(), NodeDraft::agent("root"), NOW)?;
            graph.insert(
                "seq".to_string(),
                NodeDraft::control("seq", ControlPolicy::Sequence),
                NOW,
            )?;
            graph.insert("first".to_string(), worker("first"), NOW)?;
            graph.insert("second".to_string(), worker("second"), NOW)?;
            graph.add_edge(Edge::new("seq", EdgeKind::Parent, "root"), NOW)?;
            graph.add_edge(Edge::new("first", EdgeKind::Parent, "seq"), NOW)?;
            graph.add_edge(Edge::new("second", EdgeKind::Parent, "seq"), NOW)?;
            graph.add_edge(Edge::new("first", EdgeKind::Blocks, "second"), NOW)?;
            let root = graph.node_mut("root")?;
            root.status = Status::Closed;
            root.outcome = Outcome::Expanded;
            Ok(())
        })
        .expect("seed");
    let executor =
        ScriptedExecutor::new().on("first", TerminalResult::outcome(Outcome::Failure, "broke"));

    let report = run_loop(
        &store,
        &executor,
        &AcceptAll,
        "root",
        &RunConfig::default(),
        "run-3",
        |_| {},
    )
    .expect("run");

    assert_eq!(report.stop_reason, StopReason::RootFinal);
    let decisions = &report.steps[0].reconcile;
    assert_eq!(decisions[0].policy, FlowPolicy::Sequence);
    assert_eq!(decisions[0].pruned, vec!["second".to_string()]);
    assert_eq!(decisions[0].prune_reason, Some(PruneReason::UpstreamFailure));
    let graph = store.snapshot().expect("snapshot");
    let second = graph.node("second").expect("second");
    assert_eq!((second.status, second.outcome), (Status::Duplicate, Outcome::Skipped));
    assert_eq!(graph.node("root").expect("root").outcome, Outcome::Failure);
}

/// A reviewer rejecting the first contraction sends the parent back through
/// decomposition before it can succeed.
#[test]
fn needs_work_review_reopens_parent() {
    let (_temp, store) = temp_store();
    store
        .update(|graph| {
            graph.insert("root".to_string(), NodeDraft::agent("root"), NOW)?;
            Ok(())
        })
        .expect("seed");
    let executor = ScriptedExecutor::new()
        .on("root", TerminalResult::expand(vec![ChildSpec::new(worker("try"))], ""))
        .on("root", TerminalResult::expand(vec![ChildSpec::new(worker("fix"))], ""))
        .on("try", TerminalResult::outcome(Outcome::Success, ""))
        .on("fix", TerminalResult::outcome(Outcome::Success, ""));
    let reviewer = ScriptedReviewer::new().on("root", Verdict::NeedsWork);

    let report = run_loop(
        &store,
        &executor,
        &reviewer,
        "root",
        &RunConfig::default(),
        "run-4",
        |_| {},
    )
    .expect("run");

    assert_eq!(report.stop_reason, StopReason::RootFinal);
    assert_eq!(
        reviewer.seen(),
        vec![
            ("root".to_string(), Outcome::Success),
            ("root".to_string(), Outcome::Success)
        ]
    );
    let reopen = store
        .events()
        .expect("events")
        .into_iter()
        .find(|event| event.kind == EventKind::Reopen)
        .expect("reopen event");
    assert_eq!(reopen.issue_id.as_deref(), Some("root"));
    assert_eq!(reopen.payload["reason"], "needs_work");
}

/// An executor that reports `expanded` on an execute-routed node stops the run
/// with a contract violation and leaves the node claimed.
#[test]
fn contract_violation_is_reported_not_persisted() {
    let (_temp, store) = temp_store();
    store
        .update(|graph| {
            graph.insert("job".to_string(), worker("job"), NOW)?;
            Ok(())
        })
        .expect("seed");
    let executor =
        ScriptedExecutor::new().on("job", TerminalResult::outcome(Outcome::Expanded, ""));

    let report = run_loop(
        &store,
        &executor,
        &AcceptAll,
        "job",
        &RunConfig::default(),
        "run-5",
        |_| {},
    )
    .expect("run");

    assert_eq!(report.stop_reason, StopReason::Error);
    assert_eq!(report.error.expect("error").kind, "contract_violation");
    let graph = store.snapshot().expect("snapshot");
    assert_eq!(graph.node("job").expect("job").status, Status::InProgress);
    assert!(!store.paths().lock_path.exists());
}

/// Reviewer that writes to the store mid-review, the way a reviewer calling
/// back into `dagrun` would.
struct WritingReviewer<'a> {
    store: &'a FileStore,
    lock_held: Mutex<Vec<bool>>,
}

impl Reviewer for WritingReviewer<'_> {
    fn review(&self, node: &Node, _proposed: Outcome) -> Verdict {
        self.lock_held
            .lock()
            .expect("lock_held")
            .push(self.store.paths().lock_path.exists());
        self.store
            .update(|graph| {
                graph.node(&node.id)?;
                Ok(())
            })
            .expect("store writable during review");
        Verdict::Accept
    }
}

#[test]
fn collapse_review_runs_without_the_store_lock() {
    let (_temp, store) = temp_store();
    store
        .update(|graph| {
            graph.insert("root".to_string(), NodeDraft::agent("root"), NOW)?;
            graph.insert("a".to_string(), worker("a"), NOW)?;
            graph.add_edge(Edge::new("a", EdgeKind::Parent, "root"), NOW)?;
            let root = graph.node_mut("root")?;
            root.status = Status::Closed;
            root.outcome = Outcome::Expanded;
            Ok(())
        })
        .expect("seed");
    let executor =
        ScriptedExecutor::new().on("a", TerminalResult::outcome(Outcome::Success, ""));
    let reviewer = WritingReviewer {
        store: &store,
        lock_held: Mutex::new(Vec::new()),
    };

    let report = run_loop(
        &store,
        &executor,
        &reviewer,
        "root",
        &RunConfig::default(),
        "run-6",
        |_| {},
    )
    .expect("run");

    assert_eq!(report.stop_reason, StopReason::RootFinal);
    assert_eq!(*reviewer.lock_held.lock().expect("lock_held"), vec![false]);
    assert_eq!(report.steps[0].reconcile[0].policy, FlowPolicy::Collapse);
}

/// A second runner started with defaults leaves a live claim to its owner.
#[test]
fn second_runner_does_not_steal_a_live_claim() {
    let (_temp, store) = temp_store();
    store
        .update(|graph| {
            graph.insert("root".to_string(), NodeDraft::agent("root"), NOW)?;
            graph.insert("a".to_string(), worker("a"), NOW)?;
            graph.add_edge(Edge::new("a", EdgeKind::Parent, "root"), NOW)?;
            let root = graph.node_mut("root")?;
            root.status = Status::Closed;
            root.outcome = Outcome::Expanded;
            Ok(())
        })
        .expect("seed");
    dagrun::claim::claim(&store, "a", Some("runner-1")).expect("first runner claims");

    let executor =
        ScriptedExecutor::new().on("a", TerminalResult::outcome(Outcome::Success, ""));
    let report = run_loop(
        &store,
        &executor,
        &AcceptAll,
        "root",
        &RunConfig::default(),
        "runner-2",
        |_| {},
    )
    .expect("run");

    assert!(executor.calls().is_empty());
    assert_eq!(report.stop_reason, StopReason::NoExecutableLeaf);
    let claims: Vec<Option<String>> = store
        .events()
        .expect("events")
        .into_iter()
        .filter(|event| event.kind == EventKind::Claim)
        .map(|event| event.run_id)
        .collect();
    assert_eq!(claims, vec![Some("runner-1".to_string())]);
    let graph = store.snapshot().expect("snapshot");
    assert_eq!(graph.node("a").expect("a").status, Status::InProgress);
}
