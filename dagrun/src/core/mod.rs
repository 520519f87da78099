//! Deterministic, pure logic for the issue DAG engine.
//!
//! Core modules must be free of I/O side effects. They operate on an in-memory
//! [`graph::Graph`] and return deterministic outputs suitable for tests.

pub mod graph;
pub mod index;
pub mod lifecycle;
pub mod reconcile;
pub mod selector;
pub mod termination;
pub mod types;
pub mod validator;

