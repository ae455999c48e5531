//! Stable exit codes for autorun CLI commands.

/// Command succeeded (or the hook ran, whatever it decided).
pub const OK: i32 = 0;
/// Invalid arguments, unreadable plan or config, or any other error.
pub const INVALID: i32 = 1;
/// The plan has finished its last stage.
pub const COMPLETE: i32 = 2;
/// The task is paused (safety limit or user request).
pub const PAUSED: i32 = 3;
/// The agent reported an error or the run failed.
pub const FAILED: i32 = 4;
/// The named task has no session.
pub const NOT_FOUND: i32 = 5;
