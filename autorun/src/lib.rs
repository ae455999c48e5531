//! Plan progression and recovery engine for long-running agent tasks.
//!
//! A plan is a markdown document (or a directory of stage documents) whose
//! `AUTO-RUN-CONFIG` header records the current stage. autorun detects when
//! the agent finishes a stage, advances the header, and relaunches the agent,
//! bounded by a safety limit. Failed stages are recovered by retry, skip,
//! rollback (backed by incremental snapshots) or abort.
//!
//! - **[`core`]**: Pure logic (header grammar, stage naming, limiter,
//!   transcript scanning, status transitions). No I/O.
//! - **[`io`]**: Stores and adapters (sessions, metadata, snapshots, recovery
//!   points, plan files, agent processes).
//!
//! Orchestration modules ([`advance`], [`looping`], [`recovery`], [`pause`],
//! [`safety`], [`detect`], [`status`], [`stats`], [`archive`]) combine the two behind a
//! [`context::RunContext`].

pub mod advance;
pub mod archive;
pub mod context;
pub mod core;
pub mod detect;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod pause;
pub mod recovery;
pub mod safety;
pub mod stats;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
