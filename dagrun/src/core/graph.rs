//! Flat node table plus edge list.
//!
//! Nodes live in an arena keyed by id and edges are pairs of ids. Nothing holds
//! references into other nodes, so cycle checks stay pure graph walks.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::index::DependencyIndex;
use crate::core::types::{Edge, EdgeKind, Node, NodeDraft, NodeKind, Outcome, Status};
use crate::error::DagError;

/// Current on-disk document version.
pub const GRAPH_VERSION: u32 = 1;

static ID_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$"));

/// True if `id` is a legal node id.
pub fn is_valid_id(id: &str) -> bool {
    match &*ID_PATTERN {
        Ok(pattern) => pattern.is_match(id),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub version: u32,
    /// Next creation-order value handed to a new node.
    pub next_seq: u64,
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Default for Graph {
    fn default() -> Self {
        Self {
            version: GRAPH_VERSION,
            next_seq: 1,
            nodes: BTreeMap::new(),
            edges: Vec::new(),
        }
    }
}

impl Graph {
    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node(&self, id: &str) -> Result<&Node, DagError> {
        self.nodes
            .get(id)
            .ok_or_else(|| DagError::NodeNotFound(id.to_string()))
    }

    pub fn node_mut(&mut self, id: &str) -> Result<&mut Node, DagError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| DagError::NodeNotFound(id.to_string()))
    }

    /// Insert a new open node. Typing rules for control nodes are enforced here
    /// so a malformed node never reaches the store.
    pub fn insert(&mut self, id: String, draft: NodeDraft, now: &str) -> Result<&Node, DagError> {
        if !is_valid_id(&id) {
            return Err(DagError::InvalidId(id));
        }
        if self.nodes.contains_key(&id) {
            return Err(DagError::DuplicateNode(id));
        }
        check_draft_typing(&id, &draft)?;

        let node = Node {
            id: id.clone(),
            title: draft.title,
            body: draft.body,
            status: Status::Open,
            outcome: Outcome::None,
            priority: draft.priority,
            kind: draft.kind,
            policy: draft.policy,
            execution_spec: draft.execution_spec,
            seq: self.next_seq,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        };
        self.next_seq += 1;
        Ok(self.nodes.entry(id).or_insert(node))
    }

    /// Build an edge from a raw kind name, resolving `blocked_by`/`child` aliases.
    pub fn edge_from_raw(src: &str, raw_kind: &str, dst: &str) -> Result<Edge, DagError> {
        let (kind, swap) =
            EdgeKind::parse_with_alias(raw_kind).ok_or_else(|| DagError::InvalidEdge {
                src: src.to_string(),
                dst: dst.to_string(),
                message: format!(
                    "unknown edge kind '{raw_kind}' (expected parent|blocks|related|blocked_by|child)"
                ),
            })?;
        Ok(if swap {
            Edge::new(dst, kind, src)
        } else {
            Edge::new(src, kind, dst)
        })
    }

    /// Add an edge after structural checks. Returns `false` for an exact duplicate.
    pub fn add_edge(&mut self, edge: Edge, now: &str) -> Result<bool, DagError> {
        let invalid = |message: &str| DagError::InvalidEdge {
            src: edge.src.clone(),
            dst: edge.dst.clone(),
            message: message.to_string(),
        };
        if edge.src == edge.dst {
            return Err(invalid("self-edges are not allowed"));
        }
        self.node(&edge.src)?;
        self.node(&edge.dst)?;
        if self.edges.contains(&edge) {
            return Ok(false);
        }

        let index = DependencyIndex::build(self);
        match edge.kind {
            EdgeKind::Parent => {
                if let Some(existing) = index.parent(&edge.src) {
                    return Err(invalid(&format!("node already has parent {existing}")));
                }
                if index.is_ancestor(&edge.src, &edge.dst) {
                    let mut path = vec![edge.src.clone(), edge.dst.clone()];
                    path.extend(
                        index
                            .ancestors(&edge.dst)
                            .into_iter()
                            .take_while(|id| id != &edge.src),
                    );
                    path.push(edge.src.clone());
                    return Err(DagError::Cycle { ids: path });
                }
            }
            EdgeKind::Blocks => {
                if index.is_ancestor(&edge.dst, &edge.src) {
                    return Err(DagError::BlocksAncestor {
                        src: edge.src.clone(),
                        dst: edge.dst.clone(),
                    });
                }
            }
            EdgeKind::Related => {}
        }

        self.touch(&edge.src, now);
        self.edges.push(edge);
        Ok(true)
    }

    /// Remove an edge. Returns `true` if one was removed.
    pub fn remove_edge(&mut self, edge: &Edge, now: &str) -> bool {
        let before = self.edges.len();
        self.edges.retain(|existing| existing != edge);
        let removed = self.edges.len() != before;
        if removed {
            self.touch(&edge.src, now);
        }
        removed
    }

    pub fn touch(&mut self, id: &str, now: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.updated_at = now.to_string();
        }
    }
}

pub(crate) fn check_draft_typing(id: &str, draft: &NodeDraft) -> Result<(), DagError> {
    let violation = |message: &str| DagError::TypingViolation {
        id: id.to_string(),
        message: message.to_string(),
    };
    match draft.kind {
        NodeKind::Control => {
            if draft.policy.is_none() {
                return Err(violation("control node requires a control policy"));
            }
            if draft.execution_spec.is_some() {
                return Err(violation("control node cannot carry an execution spec"));
            }
        }
        NodeKind::Agent => {
            if draft.policy.is_some() {
                return Err(violation("agent node cannot carry a control policy"));
            }
        }
    }
    Ok(())
}
