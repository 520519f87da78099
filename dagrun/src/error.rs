//! Typed errors raised by the DAG engine.
//!
//! Core operations return [`DagError`] so callers can tell recoverable claim
//! races apart from structural and contract failures. The orchestration layer
//! wraps these in `anyhow::Error` and recovers them with `downcast_ref`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node already exists: {0}")]
    DuplicateNode(String),

    #[error("invalid node id {0:?}: expected [A-Za-z0-9][A-Za-z0-9._-]*")]
    InvalidId(String),

    /// The compare-and-swap claim found the node in a non-open state.
    #[error("node {id} already claimed (status={status})")]
    AlreadyClaimed { id: String, status: String },

    /// Every candidate in a selection cycle was lost to another claimer.
    #[error("claim race: {attempts} consecutive claim attempts lost")]
    ClaimRace { attempts: u32 },

    #[error("contract violation on {id}: {message}")]
    ContractViolation { id: String, message: String },

    #[error("cycle in parent edges: {}", ids.join(" -> "))]
    Cycle { ids: Vec<String> },

    /// A `blocks` edge whose target is an ancestor of its source can never resolve.
    #[error("blocks edge {src} -> {dst} targets an ancestor of its source")]
    BlocksAncestor { src: String, dst: String },

    #[error("invalid edge {src} -> {dst}: {message}")]
    InvalidEdge {
        src: String,
        dst: String,
        message: String,
    },

    #[error("typing violation on {id}: {message}")]
    TypingViolation { id: String, message: String },

    #[error("orphaned expansion: {id} is expanded without children")]
    OrphanedExpansion { id: String },

    #[error("invalid transition on {id}: {message}")]
    InvalidTransition { id: String, message: String },
}

impl DagError {
    pub fn contract(id: &str, message: impl Into<String>) -> Self {
        Self::ContractViolation {
            id: id.to_string(),
            message: message.into(),
        }
    }

    pub fn transition(id: &str, message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// Stable snake_case name for reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NodeNotFound(_) => "node_not_found",
            Self::DuplicateNode(_) => "duplicate_node",
            Self::InvalidId(_) => "invalid_id",
            Self::AlreadyClaimed { .. } => "already_claimed",
            Self::ClaimRace { .. } => "claim_race",
            Self::ContractViolation { .. } => "contract_violation",
            Self::Cycle { .. } => "cycle",
            Self::BlocksAncestor { .. } => "blocks_ancestor",
            Self::InvalidEdge { .. } => "invalid_edge",
            Self::TypingViolation { .. } => "typing_violation",
            Self::OrphanedExpansion { .. } => "orphaned_expansion",
            Self::InvalidTransition { .. } => "invalid_transition",
        }
    }

    /// True for errors the runner loop recovers from by re-selecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AlreadyClaimed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path() {
        let err = DagError::Cycle {
            ids: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "cycle in parent edges: a -> b -> a");
    }

    #[test]
    fn only_lost_claims_are_recoverable() {
        let lost = DagError::AlreadyClaimed {
            id: "n".to_string(),
            status: "in_progress".to_string(),
        };
        assert!(lost.is_recoverable());
        assert!(!DagError::ClaimRace { attempts: 3 }.is_recoverable());
        assert!(!DagError::contract("n", "bad").is_recoverable());
        assert_eq!(DagError::ClaimRace { attempts: 3 }.code(), "claim_race");
    }
}
