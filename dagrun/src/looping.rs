//! Runner Loop: bounded select → claim → dispatch → reconcile → validate.
//!
//! One loop advances one node at a time. Every mutation goes through the
//! store, so a crashed run can be restarted (or resumed) from whatever the
//! store holds.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::claim::claim_next;
use crate::core::graph::Graph;
use crate::core::index::DependencyIndex;
use crate::core::lifecycle::{repair_candidates, reopen, reset_in_progress};
use crate::core::reconcile::{Decision, Verdict, reconcile, reconcile_subtree};
use crate::core::selector::SelectMode;
use crate::core::termination::{Termination, TerminationReason, termination_gate};
use crate::core::types::{Node, Outcome, Route};
use crate::core::validator::{ValidationReport, validate};
use crate::error::DagError;
use crate::io::clock::now_rfc3339;
use crate::io::config::{Maintenance, RunnerSection};
use crate::io::events::Event;
use crate::io::executor::Executor;
use crate::io::paths::write_atomic;
use crate::io::review::Reviewer;
use crate::io::store::GraphStore;
use crate::router::dispatch;

/// Plan/apply rounds per step before a late contraction is left for later.
const REVIEW_ROUNDS: u32 = 3;

/// Knobs for one run, from `[runner]` plus CLI overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub max_steps: u32,
    pub resume: bool,
    /// Return `in_progress` nodes under the root to `open` before the first
    /// step. Only safe when no other runner holds a live claim there.
    pub reset_in_progress: bool,
    pub claim_retries: u32,
    pub maintenance: Maintenance,
    pub repair: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from_section(&RunnerSection::default())
    }
}

impl RunConfig {
    pub fn from_section(section: &RunnerSection) -> Self {
        Self {
            max_steps: section.max_steps,
            resume: section.resume,
            reset_in_progress: false,
            claim_retries: section.claim_retries,
            maintenance: section.maintenance,
            repair: section.repair,
        }
    }
}

/// Why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The termination gate passed.
    RootFinal,
    /// Nothing under the root is selectable; the graph needs repair.
    NoExecutableLeaf,
    MaxStepsExhausted,
    /// A contract violation, exhausted claim race or I/O failure.
    Error,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RootFinal => "root_final",
            Self::NoExecutableLeaf => "no_executable_leaf",
            Self::MaxStepsExhausted => "max_steps_exhausted",
            Self::Error => "error",
        }
    }
}

/// A node reopened by repair before selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repair {
    pub id: String,
    pub reason: String,
}

/// One executed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: u32,
    pub selected: String,
    pub resumed: bool,
    pub route: Route,
    pub role: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repaired: Option<Repair>,
    pub reconcile: Vec<Decision>,
    pub validation_errors: usize,
    pub termination_before: TerminationReason,
    pub termination_after: TerminationReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    /// [`DagError::code`] when the failure was typed, `io` otherwise.
    pub kind: String,
    pub message: String,
}

/// Summary of one `run_loop` invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub root_id: String,
    pub max_steps: u32,
    /// Nodes returned from `in_progress` to `open` at start, when asked to.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reset: Vec<String>,
    pub steps: Vec<StepRecord>,
    pub stop_reason: StopReason,
    pub termination: Termination,
    pub final_validation: ValidationReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

enum Stop {
    Reason(StopReason),
    Failed(anyhow::Error),
}

/// Return every `in_progress` node under `root` to `open`, logging a reopen
/// event per node. Recovery for claims left behind by a crashed runner.
pub fn reset_claims<S: GraphStore>(
    store: &S,
    root: &str,
    run: Option<&str>,
) -> Result<Vec<String>> {
    let now = now_rfc3339();
    let reset = store.update(|graph| {
        graph.node(root)?;
        let index = DependencyIndex::build(graph);
        Ok(reset_in_progress(graph, &index, root, &now))
    })?;
    for id in &reset {
        store.append_event(&Event::reopen(id, "reset_in_progress").in_run(run))?;
    }
    if !reset.is_empty() {
        info!(count = reset.len(), "reset in-progress nodes");
    }
    Ok(reset)
}

/// Drive `root` until the termination gate passes, nothing is selectable,
/// a step fails, or `config.max_steps` steps ran.
///
/// Returns `Err` only when the run cannot start (unknown root, unreadable
/// store). Failures inside a step end the run with [`StopReason::Error`] and
/// are described in the report.
#[instrument(skip_all, fields(root = %root, run_id = %run_id, max_steps = config.max_steps))]
pub fn run_loop<S, E, R, F>(
    store: &S,
    executor: &E,
    reviewer: &R,
    root: &str,
    config: &RunConfig,
    run_id: &str,
    mut on_step: F,
) -> Result<RunReport>
where
    S: GraphStore,
    E: Executor,
    R: Reviewer,
    F: FnMut(&StepRecord),
{
    store.snapshot()?.node(root)?;
    let run = Some(run_id);

    // Claims held elsewhere stay invisible unless the caller asked for a reset.
    let reset = if config.reset_in_progress {
        reset_claims(store, root, run)?
    } else {
        Vec::new()
    };
    let mode = if config.resume {
        SelectMode::Resume
    } else {
        SelectMode::Fresh
    };

    let mut steps: Vec<StepRecord> = Vec::new();
    let stop = loop {
        let graph = match store.snapshot() {
            Ok(graph) => graph,
            Err(err) => break Stop::Failed(err),
        };
        let before = gate(&graph, root);
        if before.is_final {
            let report = validate(&graph, root);
            if report.is_ok() {
                break Stop::Reason(StopReason::RootFinal);
            }
            break Stop::Failed(anyhow::anyhow!(
                "root reached {} but validation failed: {}",
                before.root_outcome,
                report.error_codes().join(", ")
            ));
        }
        if steps.len() as u32 >= config.max_steps {
            break Stop::Reason(StopReason::MaxStepsExhausted);
        }
        let step = steps.len() as u32 + 1;
        let attempt = run_step(
            store,
            executor,
            reviewer,
            root,
            config,
            mode,
            run,
            step,
            before.reason,
        );
        match attempt {
            Ok(Some(record)) => {
                on_step(&record);
                steps.push(record);
            }
            Ok(None) => break Stop::Reason(StopReason::NoExecutableLeaf),
            Err(err) => break Stop::Failed(err),
        }
    };

    let graph = store.snapshot()?;
    let termination = gate(&graph, root);
    let final_validation = validate(&graph, root);
    let (stop_reason, error) = match stop {
        Stop::Reason(reason) => (reason, None),
        Stop::Failed(err) => {
            let kind = err
                .downcast_ref::<DagError>()
                .map_or("io", DagError::code)
                .to_string();
            warn!(kind = %kind, err = %format!("{err:#}"), "run stopped with error");
            (
                StopReason::Error,
                Some(RunError {
                    kind,
                    message: format!("{err:#}"),
                }),
            )
        }
    };
    if stop_reason == StopReason::NoExecutableLeaf {
        warn!(
            errors = final_validation.errors.len(),
            "no executable leaf under root; the graph needs repair"
        );
    }
    info!(stop_reason = stop_reason.as_str(), steps = steps.len(), "run finished");

    Ok(RunReport {
        run_id: run_id.to_string(),
        root_id: root.to_string(),
        max_steps: config.max_steps,
        reset,
        steps,
        stop_reason,
        termination,
        final_validation,
        error,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_step<S: GraphStore, E: Executor, R: Reviewer>(
    store: &S,
    executor: &E,
    reviewer: &R,
    root: &str,
    config: &RunConfig,
    mode: SelectMode,
    run: Option<&str>,
    step: u32,
    before: TerminationReason,
) -> Result<Option<StepRecord>> {
    let mut repaired = None;
    let claim = match claim_next(store, Some(root), mode, config.claim_retries, run)? {
        Some(claim) => claim,
        None if config.repair => {
            let Some(repair) = repair_one(store, root, run)? else {
                return Ok(None);
            };
            repaired = Some(repair);
            match claim_next(store, Some(root), mode, config.claim_retries, run)? {
                Some(claim) => claim,
                None => return Ok(None),
            }
        }
        None => return Ok(None),
    };

    let dispatched = dispatch(store, executor, &claim, run)?;
    let decisions = maintain(store, reviewer, &dispatched.id, root, config.maintenance)?;
    for decision in &decisions {
        for event in Event::for_decision(decision) {
            store.append_event(&event.in_run(run))?;
        }
    }

    let graph = store.snapshot()?;
    let validation = validate(&graph, root);
    if !validation.is_ok() {
        warn!(codes = ?validation.error_codes(), "validation errors after step");
    }
    let after = gate(&graph, root);
    info!(
        step,
        id = %dispatched.id,
        outcome = %dispatched.outcome,
        decisions = decisions.len(),
        "step complete"
    );

    Ok(Some(StepRecord {
        step,
        selected: dispatched.id,
        resumed: claim.resumed,
        route: dispatched.route,
        role: dispatched.role,
        outcome: dispatched.outcome,
        children: dispatched.children,
        repaired,
        reconcile: decisions,
        validation_errors: validation.errors.len(),
        termination_before: before,
        termination_after: after.reason,
    }))
}

/// Reconcile after a step without holding the store lock during review.
///
/// Each round first replays reconciliation on a snapshot to collect verdicts
/// for every proposed contraction, then applies it under the lock using only
/// those verdicts. A contraction that only became possible in between is
/// deferred and picked up by the next round.
fn maintain<S: GraphStore, R: Reviewer>(
    store: &S,
    reviewer: &R,
    changed: &str,
    root: &str,
    maintenance: Maintenance,
) -> Result<Vec<Decision>> {
    let mut verdicts: BTreeMap<String, Verdict> = BTreeMap::new();
    let mut decisions = Vec::new();
    for round in 1..=REVIEW_ROUNDS {
        let mut preview = store.snapshot()?;
        let now = now_rfc3339();
        let mut ask = |node: &Node, proposed: Outcome| {
            *verdicts
                .entry(node.id.clone())
                .or_insert_with(|| reviewer.review(node, proposed))
        };
        settle(&mut preview, changed, root, &now, maintenance, &mut ask)?;

        let mut deferred = false;
        let mut recorded = |node: &Node, _: Outcome| match verdicts.get(&node.id) {
            Some(verdict) => *verdict,
            None => {
                deferred = true;
                Verdict::Defer
            }
        };
        let applied = store.update(|graph| {
            Ok(settle(graph, changed, root, &now, maintenance, &mut recorded)?)
        })?;
        decisions.extend(applied);
        if !deferred {
            break;
        }
        debug!(round, "contraction appeared during review; reconciling again");
    }
    Ok(decisions)
}

fn settle<R: FnMut(&Node, Outcome) -> Verdict>(
    graph: &mut Graph,
    changed: &str,
    root: &str,
    now: &str,
    maintenance: Maintenance,
    review: &mut R,
) -> Result<Vec<Decision>, DagError> {
    match maintenance {
        Maintenance::Incremental => reconcile(graph, changed, root, now, review),
        Maintenance::Full => reconcile_subtree(graph, root, now, review),
    }
}

/// Reopen the first repair candidate under `root`, routing it back to
/// decomposition.
fn repair_one<S: GraphStore>(store: &S, root: &str, run: Option<&str>) -> Result<Option<Repair>> {
    let now = now_rfc3339();
    let repair = store.update(|graph| {
        let index = DependencyIndex::build(graph);
        let Some((id, reason)) = repair_candidates(graph, &index, root).into_iter().next() else {
            return Ok(None);
        };
        reopen(graph, &id, true, &now)?;
        Ok(Some(Repair {
            id,
            reason: reason.describe(),
        }))
    })?;
    if let Some(repair) = &repair {
        info!(id = %repair.id, reason = %repair.reason, "repair reopened node");
        let reason = format!("repair: {}", repair.reason);
        store.append_event(&Event::reopen(&repair.id, &reason).in_run(run))?;
    }
    Ok(repair)
}

fn gate(graph: &Graph, root: &str) -> Termination {
    termination_gate(graph, &DependencyIndex::build(graph), root)
}

/// Persist a run report as pretty JSON.
pub fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(report).context("serialize run report")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
