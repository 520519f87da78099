//! Node state transitions: claim, expansion, closing, reopening and repair.
//!
//! Every function mutates a [`Graph`] in memory and either applies fully or
//! returns an error before touching anything; the store persists the result.

use std::collections::BTreeMap;

use crate::core::graph::{Graph, check_draft_typing};
use crate::core::index::DependencyIndex;
use crate::core::types::{ChildSpec, Edge, EdgeKind, NodeKind, Outcome, Status};
use crate::error::DagError;

/// Compare-and-swap `open -> in_progress`.
pub fn mark_claimed(graph: &mut Graph, id: &str, now: &str) -> Result<(), DagError> {
    let node = graph.node_mut(id)?;
    if node.status != Status::Open {
        return Err(DagError::AlreadyClaimed {
            id: id.to_string(),
            status: node.status.as_str().to_string(),
        });
    }
    node.status = Status::InProgress;
    node.updated_at = now.to_string();
    Ok(())
}

/// Replace a claimed, decompose-routed node with children.
///
/// Creates one node per spec wired with a `parent` edge, adds `blocks` edges
/// for each `blocked_by` reference between siblings, and closes the parent as
/// `expanded`. Child ids come from `next_id`, one call per child.
pub fn expand(
    graph: &mut Graph,
    parent_id: &str,
    children: &[ChildSpec],
    next_id: &mut dyn FnMut() -> String,
    now: &str,
) -> Result<Vec<String>, DagError> {
    let parent = graph.node(parent_id)?;
    if children.is_empty() {
        return Err(DagError::contract(
            parent_id,
            "expansion produced zero children",
        ));
    }
    if parent.status != Status::InProgress {
        return Err(DagError::transition(
            parent_id,
            format!(
                "expansion requires a claimed node (status={})",
                parent.status
            ),
        ));
    }
    if parent.kind != NodeKind::Agent || parent.execution_spec.is_some() {
        return Err(DagError::transition(
            parent_id,
            "expansion requires an agent node routed to decompose",
        ));
    }

    // Validate everything up front so a bad spec leaves the graph untouched.
    // Keys only need to be unique where a `blocked_by` names them.
    let mut keys: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, spec) in children.iter().enumerate() {
        check_draft_typing(&format!("{parent_id}[{idx}]"), &spec.draft)?;
        keys.entry(spec.local_key()).or_default().push(idx);
    }
    let mut ordering: Vec<(usize, usize)> = Vec::new();
    for (idx, spec) in children.iter().enumerate() {
        for key in &spec.blocked_by {
            let src = match keys.get(key.as_str()).map(Vec::as_slice) {
                Some(&[src]) => src,
                Some([_, _, ..]) => {
                    return Err(DagError::contract(
                        parent_id,
                        format!(
                            "child '{}' is blocked by ambiguous sibling key '{key}'",
                            spec.local_key()
                        ),
                    ));
                }
                _ => {
                    return Err(DagError::contract(
                        parent_id,
                        format!(
                            "child '{}' is blocked by unknown sibling '{key}'",
                            spec.local_key()
                        ),
                    ));
                }
            };
            if src == idx {
                return Err(DagError::contract(
                    parent_id,
                    format!("child '{key}' cannot block itself"),
                ));
            }
            ordering.push((src, idx));
        }
    }

    let mut staged = graph.clone();
    let mut ids = Vec::with_capacity(children.len());
    for spec in children {
        let id = next_id();
        staged.insert(id.clone(), spec.draft.clone(), now)?;
        staged.add_edge(Edge::new(id.clone(), EdgeKind::Parent, parent_id), now)?;
        ids.push(id);
    }
    for (src, dst) in ordering {
        staged.add_edge(
            Edge::new(ids[src].clone(), EdgeKind::Blocks, ids[dst].clone()),
            now,
        )?;
    }
    let parent = staged.node_mut(parent_id)?;
    parent.status = Status::Closed;
    parent.outcome = Outcome::Expanded;
    parent.updated_at = now.to_string();

    *graph = staged;
    Ok(ids)
}

/// Close a node with a terminal outcome. `skipped` closes as `duplicate`.
pub fn close(graph: &mut Graph, id: &str, outcome: Outcome, now: &str) -> Result<(), DagError> {
    if outcome == Outcome::None {
        return Err(DagError::transition(id, "closing requires an outcome"));
    }
    let node = graph.node_mut(id)?;
    node.status = if outcome == Outcome::Skipped {
        Status::Duplicate
    } else {
        Status::Closed
    };
    node.outcome = outcome;
    node.updated_at = now.to_string();
    Ok(())
}

/// Reopen a node: status `open`, outcome cleared.
///
/// With `reorchestrate`, the execution spec is dropped too so the next claim
/// routes the node back through decomposition.
pub fn reopen(graph: &mut Graph, id: &str, reorchestrate: bool, now: &str) -> Result<(), DagError> {
    let node = graph.node_mut(id)?;
    node.status = Status::Open;
    node.outcome = Outcome::None;
    if reorchestrate {
        node.execution_spec = None;
    }
    node.updated_at = now.to_string();
    Ok(())
}

/// Return every `in_progress` node under `root` to `open`. Returns reset ids.
pub fn reset_in_progress(
    graph: &mut Graph,
    index: &DependencyIndex,
    root: &str,
    now: &str,
) -> Vec<String> {
    let mut reset = Vec::new();
    for id in index.subtree(root) {
        if let Some(node) = graph.nodes.get_mut(&id)
            && node.status == Status::InProgress
        {
            node.status = Status::Open;
            node.updated_at = now.to_string();
            reset.push(id);
        }
    }
    reset
}

/// Why a node is offered for repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairReason {
    /// Closed as failure or needs_work with nothing left running beneath it.
    Reorchestrate(Outcome),
    /// Marked expanded without any children.
    EmptyExpansion,
}

impl RepairReason {
    pub fn describe(self) -> String {
        match self {
            Self::Reorchestrate(outcome) => format!("outcome={outcome}"),
            Self::EmptyExpansion => "expanded without children".to_string(),
        }
    }
}

/// Agent nodes under `root` that can only make progress by being reopened and
/// routed back to decomposition, ordered by `(priority, seq)`.
pub fn repair_candidates(
    graph: &Graph,
    index: &DependencyIndex,
    root: &str,
) -> Vec<(String, RepairReason)> {
    let mut out = Vec::new();
    for id in index.subtree(root) {
        let Some(node) = graph.get(&id) else {
            continue;
        };
        if node.kind != NodeKind::Agent || !node.status.is_terminal() {
            continue;
        }
        let children = index.children(&id);
        match node.outcome {
            Outcome::Failure | Outcome::NeedsWork => {
                let running = children
                    .iter()
                    .any(|child| graph.get(child).is_none_or(|c| !c.is_settled()));
                if !running {
                    let reason = RepairReason::Reorchestrate(node.outcome);
                    out.push((node.priority, node.seq, id, reason));
                }
            }
            Outcome::Expanded if children.is_empty() => {
                out.push((node.priority, node.seq, id, RepairReason::EmptyExpansion));
            }
            _ => {}
        }
    }
    out.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    out.into_iter().map(|(_, _, id, reason)| (id, reason)).collect()
}
