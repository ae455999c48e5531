//! Deterministic, pure logic shared by the plan engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (header text, file names, transcript windows, counts) and return
//! deterministic outputs suitable for tests.

pub mod clock;
pub mod completion;
pub mod header;
pub mod limiter;
pub mod retention;
pub mod stage_files;
pub mod transitions;
pub mod types;
