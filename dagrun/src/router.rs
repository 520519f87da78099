//! Router: dispatch a claimed node to decomposition or execution and check
//! the route's postcondition.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::claim::Claim;
use crate::core::graph::Graph;
use crate::core::index::DependencyIndex;
use crate::core::lifecycle::{close, expand};
use crate::core::types::{Node, Outcome, Route, Status, TerminalResult};
use crate::error::DagError;
use crate::io::clock::now_rfc3339;
use crate::io::events::Event;
use crate::io::executor::{Executor, RunRequest};
use crate::io::store::{GraphStore, ID_PREFIX, new_node_id};

/// What one dispatch did to the claimed node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dispatch {
    pub id: String,
    pub route: Route,
    pub role: String,
    pub outcome: Outcome,
    /// Children created by this dispatch, if it expanded the node.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    pub provenance: String,
}

/// Run the executor for `claim` and apply its result.
///
/// Children in the result expand the node. Otherwise a node that is still
/// `in_progress` is closed with the result outcome; a node the collaborator
/// already finished through the store is left alone. Either way the stored
/// node must then satisfy the route's postcondition or the step fails with a
/// [`DagError::ContractViolation`].
#[instrument(skip_all, fields(id = %claim.id()))]
pub fn dispatch<S: GraphStore, E: Executor>(
    store: &S,
    executor: &E,
    claim: &Claim,
    run_id: Option<&str>,
) -> Result<Dispatch> {
    let request = RunRequest::new(claim.node.clone(), run_id);
    let id = request.node.id.clone();
    let route = request.route;
    info!(route = %route, role = %request.role, "dispatching");

    let result = executor
        .run(&request)
        .with_context(|| format!("executor failed for {id}"))?;
    let now = now_rfc3339();
    let created = store.update(|graph| apply_result(graph, &id, route, &result, &now))?;

    let graph = store.snapshot()?;
    check_postconditions(&graph, &id, route)?;
    let node = graph.node(&id)?;

    // A collaborator that expanded through `dagrun expand` already logged
    // its own expansion event.
    if !created.is_empty() {
        store.append_event(&Event::expansion(&id, &created).in_run(run_id))?;
    }
    store.append_event(
        &Event::result(&id, node.outcome, route.as_str(), &result.provenance).in_run(run_id),
    )?;
    info!(outcome = %node.outcome, children = created.len(), "dispatched");

    Ok(Dispatch {
        id,
        route,
        role: request.role,
        outcome: node.outcome,
        children: created,
        provenance: result.provenance,
    })
}

fn apply_result(
    graph: &mut Graph,
    id: &str,
    route: Route,
    result: &TerminalResult,
    now: &str,
) -> Result<Vec<String>> {
    let node = graph.node(id)?;
    if node.status != Status::InProgress {
        if !result.children.is_empty() {
            warn!(status = %node.status, "ignoring children for a node that is no longer claimed");
        }
        return Ok(Vec::new());
    }
    match route {
        Route::Decompose => {
            if result.outcome != Outcome::Expanded {
                return Err(DagError::contract(
                    id,
                    format!(
                        "decompose-routed node returned {} instead of expanded",
                        result.outcome
                    ),
                )
                .into());
            }
            let mut next_id = || new_node_id(ID_PREFIX);
            Ok(expand(graph, id, &result.children, &mut next_id, now)?)
        }
        Route::Execute => {
            if !result.children.is_empty() {
                return Err(DagError::contract(id, "execute-routed node returned children").into());
            }
            if !route.allows(result.outcome) {
                return Err(DagError::contract(
                    id,
                    format!("execute-routed node returned {}", result.outcome),
                )
                .into());
            }
            close(graph, id, result.outcome, now)?;
            Ok(Vec::new())
        }
    }
}

/// Check the stored node against the route it was dispatched under.
pub fn check_postconditions(graph: &Graph, id: &str, route: Route) -> Result<(), DagError> {
    let node: &Node = graph.node(id)?;
    if !node.status.is_terminal() {
        return Err(DagError::contract(
            id,
            format!("{route}-routed node ended {}; expected a terminal status", node.status),
        ));
    }
    if !route.allows(node.outcome) {
        return Err(DagError::contract(
            id,
            format!("{route}-routed node ended with outcome {}", node.outcome),
        ));
    }
    if route == Route::Decompose && DependencyIndex::build(graph).children(id).is_empty() {
        return Err(DagError::OrphanedExpansion { id: id.to_string() });
    }
    Ok(())
}
