//! Append-only event log (`.dagrun/events.jsonl`).
//!
//! One JSON object per line. External tooling reads this file to reconstruct
//! who claimed what and how every parent was decided, so the envelope and the
//! payload field names are a stable contract.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::reconcile::{Decision, PruneReason};
use crate::core::types::Outcome;
use crate::io::clock::now_ms;

/// Envelope version.
pub const EVENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Claim,
    Expansion,
    Result,
    Reconcile,
    Reopen,
    Prune,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub v: u32,
    pub ts_ms: i64,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    pub payload: Value,
}

impl Event {
    fn new(kind: EventKind, issue_id: &str, payload: Value) -> Self {
        Self {
            v: EVENT_VERSION,
            ts_ms: now_ms(),
            kind,
            run_id: None,
            issue_id: Some(issue_id.to_string()),
            payload,
        }
    }

    /// Tag the event with the run that produced it.
    pub fn in_run(mut self, run_id: Option<&str>) -> Self {
        self.run_id = run_id.map(str::to_string);
        self
    }

    /// The single "work has begun" record for a node.
    pub fn claim(id: &str, role: &str, claim_timestamp: &str, resumed: bool) -> Self {
        let mode = if resumed { "resume" } else { "claim" };
        Self::new(
            EventKind::Claim,
            id,
            json!({
                "id": id,
                "role": role,
                "claim_timestamp": claim_timestamp,
                "mode": mode,
            }),
        )
    }

    pub fn expansion(id: &str, children: &[String]) -> Self {
        Self::new(
            EventKind::Expansion,
            id,
            json!({ "id": id, "children": children }),
        )
    }

    pub fn result(id: &str, outcome: Outcome, route: &str, provenance: &str) -> Self {
        Self::new(
            EventKind::Result,
            id,
            json!({
                "id": id,
                "outcome": outcome,
                "route": route,
                "provenance": provenance,
            }),
        )
    }

    pub fn reconcile(decision: &Decision) -> Self {
        let mut payload = json!({
            "id": decision.id,
            "control_flow_policy": decision.policy.as_str(),
            "outcome": decision.outcome,
        });
        if decision.reopened {
            payload["reopened"] = Value::Bool(true);
        }
        Self::new(EventKind::Reconcile, &decision.id, payload)
    }

    pub fn reopen(id: &str, reason: &str) -> Self {
        Self::new(
            EventKind::Reopen,
            id,
            json!({ "id": id, "reason": reason }),
        )
    }

    pub fn prune(id: &str, reason: PruneReason) -> Self {
        Self::new(EventKind::Prune, id, json!({ "id": id, "reason": reason }))
    }

    /// Every event implied by one reconcile decision, in emission order.
    pub fn for_decision(decision: &Decision) -> Vec<Self> {
        let mut events = Vec::with_capacity(decision.pruned.len() + 2);
        if let Some(reason) = decision.prune_reason {
            events.extend(decision.pruned.iter().map(|id| Self::prune(id, reason)));
        }
        events.push(Self::reconcile(decision));
        if decision.reopened {
            events.push(Self::reopen(&decision.id, "needs_work"));
        }
        events
    }
}

/// Append one event as a JSON line, creating the file if needed.
pub fn append_event(path: &Path, event: &Event) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create event log dir {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(event).context("serialize event")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open event log {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append event log {}", path.display()))
}

/// Read every event. A missing log reads as empty.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read event log {}", path.display()))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reconcile::FlowPolicy;

    #[test]
    fn claim_event_carries_required_fields() {
        let event = Event::claim("a", "worker", "2026-01-01T00:00:00.000Z", false).in_run(Some("r1"));
        assert_eq!(event.kind, EventKind::Claim);
        assert_eq!(event.run_id.as_deref(), Some("r1"));
        assert_eq!(event.payload["id"], "a");
        assert_eq!(event.payload["role"], "worker");
        assert_eq!(event.payload["claim_timestamp"], "2026-01-01T00:00:00.000Z");
        assert_eq!(event.payload["mode"], "claim");
    }

    #[test]
    fn decision_expands_to_prune_reconcile_and_reopen() {
        let decision = Decision {
            id: "seq".to_string(),
            policy: FlowPolicy::Sequence,
            outcome: Outcome::Failure,
            pruned: vec!["b".to_string(), "c".to_string()],
            prune_reason: Some(PruneReason::UpstreamFailure),
            reopened: false,
        };
        let kinds: Vec<EventKind> = Event::for_decision(&decision)
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::Prune, EventKind::Prune, EventKind::Reconcile]
        );
        let reconcile = Event::reconcile(&decision);
        assert_eq!(reconcile.payload["control_flow_policy"], "sequence");
        assert_eq!(reconcile.payload["outcome"], "failure");

        let rework = Decision {
            id: "p".to_string(),
            policy: FlowPolicy::Collapse,
            outcome: Outcome::NeedsWork,
            pruned: Vec::new(),
            prune_reason: None,
            reopened: true,
        };
        let events = Event::for_decision(&rework);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Reopen);
        assert_eq!(events[1].payload["reason"], "needs_work");
    }

    #[test]
    fn jsonl_append_and_read_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs").join("events.jsonl");
        assert!(read_events(&path).expect("missing log").is_empty());

        append_event(&path, &Event::expansion("p", &["c1".to_string()])).expect("append");
        append_event(&path, &Event::result("c1", Outcome::Success, "execute", "ok"))
            .expect("append");

        let raw = fs::read_to_string(&path).expect("read");
        assert_eq!(raw.lines().count(), 2);
        let events = read_events(&path).expect("read events");
        assert_eq!(events[0].payload["children"], json!(["c1"]));
        assert_eq!(events[1].payload["outcome"], "success");
        assert_eq!(events[1].v, EVENT_VERSION);
    }
}
