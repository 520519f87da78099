//! Deterministic selection of the next unit of work.

use std::collections::BTreeSet;

use crate::core::graph::Graph;
use crate::core::index::DependencyIndex;
use crate::core::types::{Node, NodeKind, Status};

/// Whether previously claimed nodes are offered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectMode {
    /// Only `open` ready leaves are candidates.
    #[default]
    Fresh,
    /// `in_progress` agent nodes under the root are offered first.
    Resume,
}

/// A node picked for the next step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    /// True when the node was already `in_progress` and is being resumed.
    pub resumed: bool,
}

/// True if `node` is an agent node, open, with no unfinished children and no
/// unresolved blockers.
///
/// Children only count while they are still running; a node reopened for
/// re-expansion keeps its settled children and becomes a leaf again.
pub fn is_ready_leaf(graph: &Graph, index: &DependencyIndex, node: &Node) -> bool {
    node.kind == NodeKind::Agent
        && node.status == Status::Open
        && index
            .children(&node.id)
            .iter()
            .all(|child| graph.get(child).is_some_and(Node::is_settled))
        && index.unresolved_blockers(graph, &node.id).is_empty()
}

/// Ready leaves in scope, ordered by `(priority, seq, id)`.
///
/// `root = None` considers the whole graph.
pub fn ready_leaves<'a>(
    graph: &'a Graph,
    index: &DependencyIndex,
    root: Option<&str>,
) -> Vec<&'a Node> {
    let mut out: Vec<&Node> = scope(graph, index, root)
        .filter(|node| is_ready_leaf(graph, index, node))
        .collect();
    out.sort_by(|a, b| selection_key(a).cmp(&selection_key(b)));
    out
}

/// Claimed agent nodes in scope that resume mode may pick up again.
pub fn resumable<'a>(
    graph: &'a Graph,
    index: &DependencyIndex,
    root: Option<&str>,
) -> Vec<&'a Node> {
    let mut out: Vec<&Node> = scope(graph, index, root)
        .filter(|node| node.kind == NodeKind::Agent && node.status == Status::InProgress)
        .collect();
    out.sort_by(|a, b| selection_key(a).cmp(&selection_key(b)));
    out
}

/// Pick exactly one candidate, skipping ids in `skip`.
///
/// Returns `None` when nothing is eligible; callers must treat this as a
/// request for repair, not as completion.
pub fn select(
    graph: &Graph,
    index: &DependencyIndex,
    root: Option<&str>,
    mode: SelectMode,
    skip: &BTreeSet<String>,
) -> Option<Candidate> {
    if mode == SelectMode::Resume
        && let Some(node) = resumable(graph, index, root)
            .into_iter()
            .find(|node| !skip.contains(&node.id))
    {
        return Some(Candidate {
            id: node.id.clone(),
            resumed: true,
        });
    }
    ready_leaves(graph, index, root)
        .into_iter()
        .find(|node| !skip.contains(&node.id))
        .map(|node| Candidate {
            id: node.id.clone(),
            resumed: false,
        })
}

fn selection_key(node: &Node) -> (u8, u64, &str) {
    (node.priority, node.seq, node.id.as_str())
}

fn scope<'a>(
    graph: &'a Graph,
    index: &DependencyIndex,
    root: Option<&str>,
) -> Box<dyn Iterator<Item = &'a Node> + 'a> {
    match root {
        Some(root) => Box::new(
            index
                .subtree(root)
                .into_iter()
                .filter_map(move |id| graph.get(&id)),
        ),
        None => Box::new(graph.nodes.values()),
    }
}
