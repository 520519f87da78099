//! Side-effecting collaborators: storage, event log, config, processes.

pub mod clock;
pub mod config;
pub mod events;
pub mod executor;
pub mod paths;
pub mod process;
pub mod review;
pub mod store;
