//! Collapse review: a second opinion before an expanded parent is promoted.

use tracing::{info, warn};

use crate::core::reconcile::Verdict;
use crate::core::types::{ExecutionSpec, Node, Outcome};
use crate::io::executor::{Executor, RunRequest};

/// Role used when a review is routed through an executor.
pub const REVIEWER_ROLE: &str = "reviewer";

/// Judges a proposed contraction of `node` to `proposed`.
pub trait Reviewer {
    fn review(&self, node: &Node, proposed: Outcome) -> Verdict;
}

/// Accepts every contraction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Reviewer for AcceptAll {
    fn review(&self, _node: &Node, _proposed: Outcome) -> Verdict {
        Verdict::Accept
    }
}

/// Asks an executor, under the `reviewer` role, whether a parent's children
/// really delivered. A `needs_work` result sends the parent back for
/// re-expansion; any other result accepts.
///
/// Runs outside the store lock, so the executor may read the store or call
/// back into `dagrun`. The loop re-evaluates the parent before applying the
/// verdict. An executor error is logged and treated as acceptance.
pub struct ExecutorReviewer<'a, E> {
    executor: &'a E,
    run_id: Option<String>,
}

impl<'a, E: Executor> ExecutorReviewer<'a, E> {
    pub fn new(executor: &'a E, run_id: Option<&str>) -> Self {
        Self {
            executor,
            run_id: run_id.map(str::to_string),
        }
    }
}

impl<E: Executor> Reviewer for ExecutorReviewer<'_, E> {
    fn review(&self, node: &Node, proposed: Outcome) -> Verdict {
        let mut subject = node.clone();
        subject.title = format!("Collapse review: {}", node.title);
        subject.execution_spec = Some(ExecutionSpec {
            role: Some(REVIEWER_ROLE.to_string()),
            payload: serde_json::json!({ "proposed_outcome": proposed }),
        });
        let request = RunRequest::new(subject, self.run_id.as_deref());
        match self.executor.run(&request) {
            Ok(result) if result.outcome == Outcome::NeedsWork => {
                info!(id = %node.id, provenance = %result.provenance, "review requested rework");
                Verdict::NeedsWork
            }
            Ok(_) => Verdict::Accept,
            Err(err) => {
                warn!(id = %node.id, err = %format!("{err:#}"), "review failed; accepting");
                Verdict::Accept
            }
        }
    }
}
