//! Termination gate: decides whether a run root is finished.

use serde::Serialize;

use crate::core::graph::Graph;
use crate::core::index::DependencyIndex;
use crate::core::types::{Outcome, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    RootNotFound,
    RootNotTerminal,
    /// Root delegated to children that have not contracted it yet.
    ExpandedNonFinal,
    /// Root is terminal with `skipped`, `needs_work` or no outcome.
    RootTerminalNonFinalOutcome,
    /// Root reached success/failure while work below it is still open.
    RootFinalOutcomeHasActiveDescendants,
    RootFinalOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Termination {
    pub is_final: bool,
    pub reason: TerminationReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_status: Option<Status>,
    pub root_outcome: Outcome,
    /// Open or in-progress nodes under the root, excluding the root.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub active_descendants: Vec<String>,
}

/// Evaluate the termination gate for `root`.
///
/// Final iff the root is terminal with `success` or `failure` and nothing under
/// it is open or in progress. `expanded` is never final.
pub fn termination_gate(graph: &Graph, index: &DependencyIndex, root: &str) -> Termination {
    let Some(node) = graph.get(root) else {
        return Termination {
            is_final: false,
            reason: TerminationReason::RootNotFound,
            root_status: None,
            root_outcome: Outcome::None,
            active_descendants: Vec::new(),
        };
    };
    let active_descendants: Vec<String> = index
        .subtree(root)
        .into_iter()
        .filter(|id| id != root)
        .filter(|id| graph.get(id).is_some_and(|n| n.status.is_active()))
        .collect();

    let reason = if !node.status.is_terminal() {
        TerminationReason::RootNotTerminal
    } else if node.outcome == Outcome::Expanded {
        TerminationReason::ExpandedNonFinal
    } else if !matches!(node.outcome, Outcome::Success | Outcome::Failure) {
        TerminationReason::RootTerminalNonFinalOutcome
    } else if !active_descendants.is_empty() {
        TerminationReason::RootFinalOutcomeHasActiveDescendants
    } else {
        TerminationReason::RootFinalOutcome
    };

    Termination {
        is_final: reason == TerminationReason::RootFinalOutcome,
        reason,
        root_status: Some(node.status),
        root_outcome: node.outcome,
        active_descendants,
    }
}
