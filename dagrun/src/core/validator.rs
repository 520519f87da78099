//! Read-only structural checks over the subtree of a root.
//!
//! Findings carry stable codes so tooling can match on them. Nothing here
//! mutates the graph; repairs are the caller's decision.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::core::graph::Graph;
use crate::core::index::DependencyIndex;
use crate::core::types::{EdgeKind, NodeKind, Outcome};

/// Invariant names reported in [`ValidationReport::checks`].
pub const CHECKS: [&str; 6] = [
    "parent_acyclic",
    "node_typing",
    "terminal_outcomes",
    "blocks_wiring",
    "expansion_integrity",
    "edge_integrity",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub code: String,
    pub message: String,
    pub ids: Vec<String>,
}

impl Finding {
    fn new(code: &str, message: impl Into<String>, ids: &[&str]) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            ids: ids.iter().map(|id| (*id).to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub root_id: String,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
    /// Invariant name -> passed.
    pub checks: BTreeMap<String, bool>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, check: &str, finding: Finding) {
        self.checks.insert(check.to_string(), false);
        self.errors.push(finding);
    }

    fn warn(&mut self, finding: Finding) {
        self.warnings.push(finding);
    }

    /// Codes of all errors, in report order.
    pub fn error_codes(&self) -> Vec<&str> {
        self.errors.iter().map(|f| f.code.as_str()).collect()
    }
}

/// Validate the subtree of `root`.
pub fn validate(graph: &Graph, root: &str) -> ValidationReport {
    let mut report = ValidationReport {
        root_id: root.to_string(),
        errors: Vec::new(),
        warnings: Vec::new(),
        checks: CHECKS.iter().map(|c| ((*c).to_string(), true)).collect(),
    };
    let Some(root_node) = graph.get(root) else {
        report.error(
            "edge_integrity",
            Finding::new("root_not_found", format!("root {root} not found"), &[root]),
        );
        return report;
    };

    let index = DependencyIndex::build(graph);
    let scope: BTreeSet<String> = index.subtree_set(root);

    for cycle in index.parent_cycles(root) {
        let ids: Vec<&str> = cycle.iter().map(String::as_str).collect();
        report.error(
            "parent_acyclic",
            Finding::new(
                "parent_cycle",
                format!("parent cycle: {}", cycle.join(" -> ")),
                &ids,
            ),
        );
    }

    for id in &scope {
        let Some(node) = graph.get(id) else {
            continue;
        };
        match node.kind {
            NodeKind::Control => {
                if node.execution_spec.is_some() {
                    report.error(
                        "node_typing",
                        Finding::new(
                            "node_control_has_execution_spec",
                            format!("control node {id} carries an execution spec"),
                            &[id.as_str()],
                        ),
                    );
                }
                if node.policy.is_none() {
                    report.error(
                        "node_typing",
                        Finding::new(
                            "node_control_missing_policy",
                            format!("control node {id} has no control policy"),
                            &[id.as_str()],
                        ),
                    );
                }
            }
            NodeKind::Agent => {
                if node.policy.is_some() {
                    report.error(
                        "node_typing",
                        Finding::new(
                            "node_agent_has_policy",
                            format!("agent node {id} carries a control policy"),
                            &[id.as_str()],
                        ),
                    );
                }
            }
        }

        if node.status.is_terminal() && node.outcome == Outcome::None {
            report.error(
                "terminal_outcomes",
                Finding::new(
                    "terminal_node_missing_outcome",
                    format!("{id} is {} without an outcome", node.status),
                    &[id.as_str()],
                ),
            );
        }
        if !node.status.is_terminal() && node.outcome != Outcome::None {
            report.error(
                "terminal_outcomes",
                Finding::new(
                    "outcome_without_terminal_status",
                    format!("{id} is {} but has outcome {}", node.status, node.outcome),
                    &[id.as_str()],
                ),
            );
        }

        if node.outcome == Outcome::Expanded && index.children(id).is_empty() {
            report.error(
                "expansion_integrity",
                Finding::new(
                    "orphaned_expanded_node",
                    format!("{id} is expanded but has no children"),
                    &[id.as_str()],
                ),
            );
        }

        let parents = index.parents(id);
        if parents.len() > 1 {
            let mut ids = vec![id.as_str()];
            ids.extend(parents.iter().map(String::as_str));
            report.error(
                "edge_integrity",
                Finding::new(
                    "multiple_parents",
                    format!("{id} has {} parents", parents.len()),
                    &ids,
                ),
            );
        }
    }

    for edge in &graph.edges {
        let src_in = scope.contains(&edge.src);
        let dst_in = scope.contains(&edge.dst);
        if !src_in && !dst_in {
            continue;
        }
        if graph.get(&edge.src).is_none() || graph.get(&edge.dst).is_none() {
            report.error(
                "edge_integrity",
                Finding::new(
                    "dangling_edge",
                    format!(
                        "{} edge {} -> {} references a missing node",
                        edge.kind, edge.src, edge.dst
                    ),
                    &[edge.src.as_str(), edge.dst.as_str()],
                ),
            );
            continue;
        }
        if edge.kind != EdgeKind::Blocks {
            continue;
        }
        if index.is_ancestor(&edge.dst, &edge.src) {
            report.error(
                "blocks_wiring",
                Finding::new(
                    "blocks_descendant_to_ancestor",
                    format!(
                        "blocks edge {} -> {} targets an ancestor of its source",
                        edge.src, edge.dst
                    ),
                    &[edge.src.as_str(), edge.dst.as_str()],
                ),
            );
        } else if src_in != dst_in {
            report.warn(Finding::new(
                "blocks_cross_scope",
                format!(
                    "blocks edge {} -> {} crosses the boundary of {root}",
                    edge.src, edge.dst
                ),
                &[edge.src.as_str(), edge.dst.as_str()],
            ));
        }
    }

    if root_node.outcome == Outcome::Expanded {
        let active = scope
            .iter()
            .filter(|id| id.as_str() != root)
            .any(|id| graph.get(id).is_some_and(|n| n.status.is_active()));
        if !active {
            report.warn(Finding::new(
                "root_expanded_without_active_descendants",
                format!("{root} is expanded but nothing under it is open or in progress"),
                &[root],
            ));
        }
    }

    report
}
