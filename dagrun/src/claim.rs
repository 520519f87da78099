//! Claim Manager: turns a selected candidate into exactly one live claim.

use std::collections::BTreeSet;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::index::DependencyIndex;
use crate::core::lifecycle::mark_claimed;
use crate::core::selector::{SelectMode, select};
use crate::core::types::{Node, Route, Status};
use crate::error::DagError;
use crate::io::clock::now_rfc3339;
use crate::io::events::Event;
use crate::io::store::GraphStore;

/// A node this caller now owns.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    /// The node as stored right after the claim.
    pub node: Node,
    /// True when an `in_progress` node was picked up again in resume mode.
    pub resumed: bool,
    pub claimed_at: String,
}

impl Claim {
    pub fn id(&self) -> &str {
        &self.node.id
    }
}

/// Atomically move `id` from `open` to `in_progress`.
///
/// Fails with [`DagError::AlreadyClaimed`] and no side effects when another
/// caller got there first. Only a successful claim emits a claim event.
#[instrument(skip(store))]
pub fn claim<S: GraphStore>(store: &S, id: &str, run_id: Option<&str>) -> Result<Claim> {
    let claimed_at = now_rfc3339();
    let node = store.update(|graph| {
        mark_claimed(graph, id, &claimed_at)?;
        Ok(graph.node(id)?.clone())
    })?;
    let role = Route::for_node(&node).role(&node);
    store.append_event(&Event::claim(id, &role, &claimed_at, false).in_run(run_id))?;
    info!(id, role = %role, "claimed");
    Ok(Claim {
        node,
        resumed: false,
        claimed_at,
    })
}

/// Take over an `in_progress` node in resume mode.
fn resume<S: GraphStore>(store: &S, id: &str, run_id: Option<&str>) -> Result<Claim> {
    let claimed_at = now_rfc3339();
    let node = store.update(|graph| {
        let node = graph.node_mut(id)?;
        if node.status != Status::InProgress {
            return Err(DagError::AlreadyClaimed {
                id: id.to_string(),
                status: node.status.as_str().to_string(),
            }
            .into());
        }
        node.updated_at = claimed_at.clone();
        Ok(node.clone())
    })?;
    let role = Route::for_node(&node).role(&node);
    store.append_event(&Event::claim(id, &role, &claimed_at, true).in_run(run_id))?;
    info!(id, role = %role, "resumed claim");
    Ok(Claim {
        node,
        resumed: true,
        claimed_at,
    })
}

/// Select and claim the next node under `root`.
///
/// A lost race drops that candidate for this call only and selection runs
/// again. After `retries` consecutive losses the call fails with
/// [`DagError::ClaimRace`]. `Ok(None)` means nothing is selectable.
#[instrument(skip(store, run_id))]
pub fn claim_next<S: GraphStore>(
    store: &S,
    root: Option<&str>,
    mode: SelectMode,
    retries: u32,
    run_id: Option<&str>,
) -> Result<Option<Claim>> {
    let mut attempted: BTreeSet<String> = BTreeSet::new();
    let mut lost = 0u32;
    loop {
        let graph = store.snapshot()?;
        let index = DependencyIndex::build(&graph);
        let Some(candidate) = select(&graph, &index, root, mode, &attempted) else {
            debug!(lost, "no candidate");
            return Ok(None);
        };
        let attempt = if candidate.resumed {
            resume(store, &candidate.id, run_id)
        } else {
            claim(store, &candidate.id, run_id)
        };
        match attempt {
            Ok(claim) => return Ok(Some(claim)),
            Err(err)
                if err
                    .downcast_ref::<DagError>()
                    .is_some_and(DagError::is_recoverable) =>
            {
                lost += 1;
                debug!(id = %candidate.id, lost, "lost claim race");
                if lost >= retries {
                    return Err(anyhow!(DagError::ClaimRace { attempts: lost }));
                }
                attempted.insert(candidate.id);
            }
            Err(err) => return Err(err),
        }
    }
}
