//! I/O helpers for autorun commands.

pub mod agent;
pub mod atomic;
pub mod config;
pub mod execution_state;
pub mod hook_input;
pub mod metadata;
pub mod paths;
pub mod plan;
pub mod process;
pub mod recovery_points;
pub mod session_store;
pub mod snapshot;
pub mod transcript;
