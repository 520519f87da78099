//! Test-only helpers: graph builders and scripted collaborators.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::graph::Graph;
use crate::core::reconcile::Verdict;
use crate::core::types::{Edge, EdgeKind, Node, NodeDraft, Outcome, Status, TerminalResult};
use crate::io::executor::{Executor, RunRequest};
use crate::io::paths::{InitOptions, init_dag};
use crate::io::review::Reviewer;
use crate::io::store::FileStore;

/// Fixed timestamp for deterministic graphs.
pub const NOW: &str = "2026-01-01T00:00:00.000Z";

/// Graph with one open agent node per id, created in order. Titles equal ids.
pub fn graph_with(ids: &[&str]) -> Graph {
    let mut graph = Graph::default();
    for id in ids {
        graph
            .insert((*id).to_string(), NodeDraft::agent(*id), NOW)
            .expect("insert node");
    }
    graph
}

/// Add a `parent` edge making `child` a child of `parent`.
pub fn link(graph: &mut Graph, child: &str, parent: &str) {
    graph
        .add_edge(Edge::new(child, EdgeKind::Parent, parent), NOW)
        .expect("link");
}

/// Force a node terminal with `outcome`, bypassing lifecycle checks.
pub fn close(graph: &mut Graph, id: &str, outcome: Outcome) {
    let node = graph.node_mut(id).expect("node");
    node.status = if outcome == Outcome::Skipped {
        Status::Duplicate
    } else {
        Status::Closed
    };
    node.outcome = outcome;
}

/// Deterministic id source: `prefix-1`, `prefix-2`, ...
pub fn id_sequence(prefix: &str) -> impl FnMut() -> String {
    let prefix = prefix.to_string();
    let mut next = 0u32;
    move || {
        next += 1;
        format!("{prefix}-{next}")
    }
}

/// Initialised `.dagrun/` in a fresh temp dir.
pub fn temp_store() -> (TempDir, FileStore) {
    let temp = tempfile::tempdir().expect("tempdir");
    init_dag(temp.path(), &InitOptions { force: false }).expect("init");
    let store = FileStore::open(temp.path()).expect("open store");
    (temp, store)
}

/// Executor that replays queued results.
///
/// Results are keyed by node id or title, so children created at run time
/// (with generated ids) can be scripted by title.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<BTreeMap<String, VecDeque<TerminalResult>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `result` for the node whose id or title is `key`.
    pub fn on(self, key: &str, result: TerminalResult) -> Self {
        self.script
            .lock()
            .expect("script lock")
            .entry(key.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// Ids executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl Executor for ScriptedExecutor {
    fn run(&self, request: &RunRequest) -> Result<TerminalResult> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(request.node.id.clone());
        let mut script = self.script.lock().expect("script lock");
        for key in [&request.node.id, &request.node.title] {
            if let Some(result) = script.get_mut(key.as_str()).and_then(VecDeque::pop_front) {
                return Ok(result);
            }
        }
        Err(anyhow!("no scripted result for {}", request.node.id))
    }
}

/// Reviewer that returns queued verdicts per node id and accepts otherwise.
#[derive(Default)]
pub struct ScriptedReviewer {
    verdicts: Mutex<BTreeMap<String, VecDeque<Verdict>>>,
    seen: Mutex<Vec<(String, Outcome)>>,
}

impl ScriptedReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, id: &str, verdict: Verdict) -> Self {
        self.verdicts
            .lock()
            .expect("verdict lock")
            .entry(id.to_string())
            .or_default()
            .push_back(verdict);
        self
    }

    /// `(id, proposed outcome)` for every review requested.
    pub fn seen(&self) -> Vec<(String, Outcome)> {
        self.seen.lock().expect("seen lock").clone()
    }
}

impl Reviewer for ScriptedReviewer {
    fn review(&self, node: &Node, proposed: Outcome) -> Verdict {
        self.seen
            .lock()
            .expect("seen lock")
            .push((node.id.clone(), proposed));
        self.verdicts
            .lock()
            .expect("verdict lock")
            .get_mut(&node.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Verdict::Accept)
    }
}
