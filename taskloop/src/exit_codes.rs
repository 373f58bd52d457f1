//! Stable exit codes for taskloop CLI commands.

/// Command succeeded; the loop can keep running.
pub const OK: i32 = 0;
/// Command failed due to invalid home/config/input or any other error.
pub const INVALID: i32 = 1;
/// The run is terminated (goal satisfied, budget exhausted, nothing runnable).
pub const TERMINATED: i32 = 2;
/// The loop is suspended on an unanswered question.
pub const WAITING: i32 = 3;
