//! Shared deterministic types for the issue DAG.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default priority for nodes created without an explicit one.
pub const DEFAULT_PRIORITY: u8 = 3;

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Open,
    InProgress,
    Closed,
    Duplicate,
}

impl Status {
    /// `closed` and `duplicate` are terminal; outcomes are only meaningful there.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Duplicate)
    }

    /// Open or claimed work that still has to run.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Result recorded on a terminal node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    None,
    Success,
    Failure,
    Expanded,
    Skipped,
    NeedsWork,
}

impl Outcome {
    /// Outcomes that let an expanded parent contract to `success`.
    pub fn is_successful_family(self) -> bool {
        matches!(self, Self::Success | Self::Skipped | Self::Expanded)
    }

    /// Outcomes that release a `blocks` edge. An expanded source still has
    /// delegated work in flight, so it keeps blocking until contracted.
    pub fn resolves_blocker(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    /// Outcomes a control node can aggregate over.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Expanded => "expanded",
            Self::Skipped => "skipped",
            Self::NeedsWork => "needs_work",
        }
    }
}

/// Whether a node does work itself or only aggregates its children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Agent,
    Control,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Control => "control",
        }
    }
}

/// Aggregation rule for control nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPolicy {
    /// All children must succeed; the first failure fails the node.
    Sequence,
    /// The first success succeeds the node; fails once every child failed.
    Fallback,
    /// Strict majority of successes once all children are terminal.
    Parallel,
}

impl ControlPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Fallback => "fallback",
            Self::Parallel => "parallel",
        }
    }
}

/// Typed relation between two nodes.
///
/// Edges are directed `src -> dst`:
/// - `parent`: `src` is a child of `dst`
/// - `blocks`: `src` must finish before `dst` is eligible
/// - `related`: informational only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Parent,
    Blocks,
    Related,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Blocks => "blocks",
            Self::Related => "related",
        }
    }

    /// Parse an edge kind, accepting the inverse aliases `blocked_by` and
    /// `child`. The returned flag is true when the endpoints must be swapped.
    pub fn parse_with_alias(raw: &str) -> Option<(Self, bool)> {
        match raw.trim() {
            "parent" => Some((Self::Parent, false)),
            "child" => Some((Self::Parent, true)),
            "blocks" => Some((Self::Blocks, false)),
            "blocked_by" => Some((Self::Blocks, true)),
            "related" => Some((Self::Related, false)),
            _ => None,
        }
    }
}

macro_rules! impl_text_enum {
    ($ty:ty, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                let raw = raw.trim();
                [$($variant),+]
                    .into_iter()
                    .find(|candidate: &$ty| candidate.as_str() == raw)
                    .ok_or_else(|| {
                        let allowed = [$($variant.as_str()),+].join("|");
                        format!("invalid value '{raw}' (expected {allowed})")
                    })
            }
        }
    };
}

impl_text_enum!(
    Status,
    [
        Status::Open,
        Status::InProgress,
        Status::Closed,
        Status::Duplicate
    ]
);
impl_text_enum!(
    Outcome,
    [
        Outcome::None,
        Outcome::Success,
        Outcome::Failure,
        Outcome::Expanded,
        Outcome::Skipped,
        Outcome::NeedsWork,
    ]
);
impl_text_enum!(NodeKind, [NodeKind::Agent, NodeKind::Control]);

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl_text_enum!(
    ControlPolicy,
    [
        ControlPolicy::Sequence,
        ControlPolicy::Fallback,
        ControlPolicy::Parallel
    ]
);

/// Opaque execution payload. Presence routes a node to execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    /// Executor role; the router falls back to `worker` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Free-form payload handed to the executor untouched.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// One unit of hierarchical work ("issue").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub status: Status,
    #[serde(default)]
    pub outcome: Outcome,
    /// Lower is more urgent.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ControlPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_spec: Option<ExecutionSpec>,
    /// Creation order, assigned by the graph; used for deterministic tie-breaks.
    pub seq: u64,
    pub created_at: String,
    pub updated_at: String,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Node {
    /// Terminal with an outcome that asks for nothing further: not `expanded`
    /// (children still owe work) and not `needs_work` (awaiting re-expansion).
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal()
            && !matches!(self.outcome, Outcome::Expanded | Outcome::NeedsWork)
    }
}

/// Directed edge between two node ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub src: String,
    pub kind: EdgeKind,
    pub dst: String,
}

impl Edge {
    pub fn new(src: impl Into<String>, kind: EdgeKind, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            kind,
            dst: dst.into(),
        }
    }
}

/// Fields for a node that does not exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDraft {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ControlPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_spec: Option<ExecutionSpec>,
}

impl NodeDraft {
    pub fn agent(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: String::new(),
            priority: DEFAULT_PRIORITY,
            kind: NodeKind::Agent,
            policy: None,
            execution_spec: None,
        }
    }

    pub fn control(title: impl Into<String>, policy: ControlPolicy) -> Self {
        Self {
            kind: NodeKind::Control,
            policy: Some(policy),
            ..Self::agent(title)
        }
    }
}

/// One child requested by a decomposition step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Local name used by sibling `blocked_by` references. Defaults to the title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(flatten)]
    pub draft: NodeDraft,
    /// Keys of siblings that must finish before this child is eligible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
}

impl ChildSpec {
    pub fn new(draft: NodeDraft) -> Self {
        Self {
            key: None,
            draft,
            blocked_by: Vec::new(),
        }
    }

    pub fn local_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.draft.title)
    }

    /// Wire each child to wait on the one before it.
    ///
    /// A child whose key repeats an earlier sibling's gets an explicit
    /// `key#position` so the chain references stay unambiguous.
    pub fn chain(mut specs: Vec<ChildSpec>) -> Vec<ChildSpec> {
        let mut seen = BTreeSet::new();
        for (idx, spec) in specs.iter_mut().enumerate() {
            if !seen.insert(spec.local_key().to_string()) {
                spec.key = Some(format!("{}#{}", spec.local_key(), idx + 1));
                seen.insert(spec.local_key().to_string());
            }
        }
        let keys: Vec<String> = specs.iter().map(|s| s.local_key().to_string()).collect();
        for (idx, spec) in specs.iter_mut().enumerate().skip(1) {
            let prev = &keys[idx - 1];
            if !spec.blocked_by.contains(prev) {
                spec.blocked_by.push(prev.clone());
            }
        }
        specs
    }
}

/// Result returned by an executor for one claimed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalResult {
    pub outcome: Outcome,
    /// Free-form text describing what the executor did.
    #[serde(default)]
    pub provenance: String,
    /// Children to expand into; only legal on decompose-routed nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildSpec>,
}

impl TerminalResult {
    pub fn outcome(outcome: Outcome, provenance: impl Into<String>) -> Self {
        Self {
            outcome,
            provenance: provenance.into(),
            children: Vec::new(),
        }
    }

    pub fn expand(children: Vec<ChildSpec>, provenance: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Expanded,
            provenance: provenance.into(),
            children,
        }
    }
}

/// Role used for decompose-routed nodes.
pub const ORCHESTRATOR_ROLE: &str = "orchestrator";
/// Role used for execute-routed nodes whose spec names none.
pub const DEFAULT_WORKER_ROLE: &str = "worker";

/// What a claimed node is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// No execution spec: produce children and end `expanded`.
    Decompose,
    /// Execution spec present: end `success`, `failure` or `skipped`.
    Execute,
}

impl Route {
    pub fn for_node(node: &Node) -> Self {
        if node.execution_spec.is_some() {
            Self::Execute
        } else {
            Self::Decompose
        }
    }

    /// Executor role for `node` under this route.
    pub fn role(self, node: &Node) -> String {
        match self {
            Self::Decompose => ORCHESTRATOR_ROLE.to_string(),
            Self::Execute => node
                .execution_spec
                .as_ref()
                .and_then(|spec| spec.role.clone())
                .filter(|role| !role.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_WORKER_ROLE.to_string()),
        }
    }

    /// Outcomes a node may legally end with under this route.
    pub fn allows(self, outcome: Outcome) -> bool {
        match self {
            Self::Decompose => outcome == Outcome::Expanded,
            Self::Execute => outcome.is_final(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decompose => "decompose",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
