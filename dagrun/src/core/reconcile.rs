//! Upward propagation of child outcomes into parents.
//!
//! Agent parents that expanded contract once every child settled; control
//! nodes aggregate under their policy. Every evaluation reads only the current
//! child states, so re-running a walk after an interruption is a no-op for
//! anything already decided.

use serde::Serialize;

use crate::core::graph::Graph;
use crate::core::index::DependencyIndex;
use crate::core::lifecycle::{close, reopen};
use crate::core::types::{ControlPolicy, Node, NodeKind, Outcome, Status};
use crate::error::DagError;

/// Rule that produced a reconcile decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPolicy {
    Sequence,
    Fallback,
    Parallel,
    /// Contraction of an expanded agent parent.
    Collapse,
}

impl From<ControlPolicy> for FlowPolicy {
    fn from(policy: ControlPolicy) -> Self {
        match policy {
            ControlPolicy::Sequence => Self::Sequence,
            ControlPolicy::Fallback => Self::Fallback,
            ControlPolicy::Parallel => Self::Parallel,
        }
    }
}

impl FlowPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Fallback => "fallback",
            Self::Parallel => "parallel",
            Self::Collapse => "collapse",
        }
    }
}

/// Verdict from the optional collapse review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    NeedsWork,
    /// No verdict yet: the parent stays expanded and the walk stops there.
    Defer,
}

/// Review that accepts every proposed contraction.
pub fn accept_all(_node: &Node, _proposed: Outcome) -> Verdict {
    Verdict::Accept
}

/// Reason recorded on children skipped by a short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    /// A sibling failed inside a `sequence`.
    UpstreamFailure,
    /// A sibling already satisfied a `fallback`.
    Pruned,
}

/// One parent whose outcome changed during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub id: String,
    pub policy: FlowPolicy,
    pub outcome: Outcome,
    /// Descendants closed as `skipped` by a short-circuit.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pruned: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune_reason: Option<PruneReason>,
    /// True when review rejected the contraction and the node was reopened.
    pub reopened: bool,
}

/// Aggregate final child outcomes under a control policy.
///
/// `children[i]` is `Some(outcome)` once child `i` settled on success, failure
/// or skipped, and `None` while it is still running. Returns `None` while the
/// policy cannot decide yet.
pub fn evaluate_control(policy: ControlPolicy, children: &[Option<Outcome>]) -> Option<Outcome> {
    if children.is_empty() {
        return None;
    }
    let all_final = children.iter().all(Option::is_some);
    let successes = children
        .iter()
        .filter(|c| **c == Some(Outcome::Success))
        .count();
    match policy {
        ControlPolicy::Sequence => {
            if children.contains(&Some(Outcome::Failure)) {
                Some(Outcome::Failure)
            } else if !all_final {
                None
            } else if successes == children.len() {
                Some(Outcome::Success)
            } else {
                Some(Outcome::Failure)
            }
        }
        ControlPolicy::Fallback => {
            if successes > 0 {
                Some(Outcome::Success)
            } else if all_final {
                Some(Outcome::Failure)
            } else {
                None
            }
        }
        ControlPolicy::Parallel => {
            if !all_final {
                return None;
            }
            // Strict majority; a tie is a failure.
            if successes > children.len() - successes {
                Some(Outcome::Success)
            } else {
                Some(Outcome::Failure)
            }
        }
    }
}

enum Evaluation {
    Decided(Decision),
    AlreadyFinal,
    Pending,
}

/// Re-evaluate ancestors of `changed` up to and including `root`.
///
/// The walk stops at the first ancestor that cannot be decided yet, and after
/// a reviewed contraction is sent back for rework.
///
/// `review` sees every proposed successful contraction as `(parent, outcome)`.
pub fn reconcile<R: FnMut(&Node, Outcome) -> Verdict>(
    graph: &mut Graph,
    changed: &str,
    root: &str,
    now: &str,
    review: &mut R,
) -> Result<Vec<Decision>, DagError> {
    graph.node(changed)?;
    let index = DependencyIndex::build(graph);
    let scope = index.subtree_set(root);
    let mut decisions = Vec::new();
    let mut current = changed.to_string();

    while current != root {
        let Some(parent) = index.parent(&current).map(str::to_string) else {
            break;
        };
        if !scope.contains(&parent) {
            break;
        }
        match evaluate_node(graph, &index, &parent, now, review)? {
            Evaluation::Decided(decision) => {
                let reopened = decision.reopened;
                decisions.push(decision);
                if reopened {
                    break;
                }
            }
            Evaluation::AlreadyFinal => {}
            Evaluation::Pending => break,
        }
        current = parent;
    }
    Ok(decisions)
}

/// Re-evaluate every control and expanded node under `root`, bottom-up,
/// until nothing changes.
pub fn reconcile_subtree<R: FnMut(&Node, Outcome) -> Verdict>(
    graph: &mut Graph,
    root: &str,
    now: &str,
    review: &mut R,
) -> Result<Vec<Decision>, DagError> {
    graph.node(root)?;
    let index = DependencyIndex::build(graph);
    let order = index.post_order(root);
    let mut decisions = Vec::new();
    for _ in 0..=order.len() {
        let mut progressed = false;
        for id in &order {
            let evaluation = evaluate_node(graph, &index, id, now, review)?;
            if let Evaluation::Decided(decision) = evaluation {
                decisions.push(decision);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    Ok(decisions)
}

fn evaluate_node<R: FnMut(&Node, Outcome) -> Verdict>(
    graph: &mut Graph,
    index: &DependencyIndex,
    id: &str,
    now: &str,
    review: &mut R,
) -> Result<Evaluation, DagError> {
    let node = graph.node(id)?;
    let children = index.children(id);
    match node.kind {
        NodeKind::Control => {
            if node.status.is_terminal() {
                return Ok(Evaluation::AlreadyFinal);
            }
            // A control node without a policy is a typing violation the
            // validator reports; it can never decide.
            let Some(policy) = node.policy else {
                return Ok(Evaluation::Pending);
            };
            let states: Vec<Option<Outcome>> = children
                .iter()
                .map(|child| {
                    graph
                        .get(child)
                        .filter(|c| c.status.is_terminal() && c.outcome.is_final())
                        .map(|c| c.outcome)
                })
                .collect();
            let Some(outcome) = evaluate_control(policy, &states) else {
                return Ok(Evaluation::Pending);
            };
            let prune_reason = match (policy, outcome) {
                (ControlPolicy::Sequence, Outcome::Failure) => {
                    Some(PruneReason::UpstreamFailure)
                }
                (ControlPolicy::Fallback, Outcome::Success) => Some(PruneReason::Pruned),
                _ => None,
            };
            let pruned = match prune_reason {
                Some(_) => prune_unsettled(graph, index, children, now),
                None => Vec::new(),
            };
            close(graph, id, outcome, now)?;
            Ok(Evaluation::Decided(Decision {
                id: id.to_string(),
                policy: policy.into(),
                outcome,
                prune_reason: prune_reason.filter(|_| !pruned.is_empty()),
                pruned,
                reopened: false,
            }))
        }
        NodeKind::Agent => {
            if !(node.status.is_terminal() && node.outcome == Outcome::Expanded) {
                return Ok(if node.is_settled() {
                    Evaluation::AlreadyFinal
                } else {
                    Evaluation::Pending
                });
            }
            if children.is_empty() {
                return Ok(Evaluation::Pending);
            }
            let mut kids = Vec::with_capacity(children.len());
            for child in children {
                match graph.get(child) {
                    Some(kid) if kid.is_settled() => kids.push(kid.outcome),
                    _ => return Ok(Evaluation::Pending),
                }
            }
            let proposed = if kids.iter().all(|o| o.is_successful_family()) {
                Outcome::Success
            } else {
                Outcome::Failure
            };
            let verdict = if proposed == Outcome::Success {
                review(node, proposed)
            } else {
                Verdict::Accept
            };
            match verdict {
                Verdict::Accept => {
                    close(graph, id, proposed, now)?;
                    Ok(Evaluation::Decided(Decision {
                        id: id.to_string(),
                        policy: FlowPolicy::Collapse,
                        outcome: proposed,
                        pruned: Vec::new(),
                        prune_reason: None,
                        reopened: false,
                    }))
                }
                Verdict::Defer => Ok(Evaluation::Pending),
                Verdict::NeedsWork => {
                    reopen(graph, id, true, now)?;
                    Ok(Evaluation::Decided(Decision {
                        id: id.to_string(),
                        policy: FlowPolicy::Collapse,
                        outcome: Outcome::NeedsWork,
                        pruned: Vec::new(),
                        prune_reason: None,
                        reopened: true,
                    }))
                }
            }
        }
    }
}

/// Close every unsettled child subtree as `duplicate/skipped`.
fn prune_unsettled(
    graph: &mut Graph,
    index: &DependencyIndex,
    children: &[String],
    now: &str,
) -> Vec<String> {
    let mut pruned = Vec::new();
    for child in children {
        if graph.get(child).is_none_or(Node::is_settled) {
            continue;
        }
        for id in index.subtree(child) {
            if let Some(node) = graph.nodes.get_mut(&id)
                && !node.is_settled()
            {
                node.status = Status::Duplicate;
                node.outcome = Outcome::Skipped;
                node.updated_at = now.to_string();
                pruned.push(id);
            }
        }
    }
    pruned
}
