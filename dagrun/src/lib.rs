//! Issue-DAG orchestration engine.
//!
//! Work is a graph of issues ("nodes") joined by `parent`, `blocks` and
//! `related` edges. A bounded loop repeatedly picks one ready leaf, claims it,
//! hands it to an executor (decompose into children or execute to an outcome)
//! and reconciles parents until the root reaches a final outcome. The
//! architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (graph, index, selection,
//!   lifecycle, reconciliation, validation, termination). No I/O.
//! - **[`io`]**: Side effects (graph store, event log, config, subprocesses).
//!
//! Orchestration modules ([`claim`], [`router`], [`looping`]) combine the two
//! to implement the `dagrun` commands.

pub mod claim;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod router;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
