//! Stable exit codes for the `eval` binary.

/// Every item scored and the report was written.
pub const OK: i32 = 0;
/// Configuration, manifest or I/O problem before or after the run.
pub const INVALID: i32 = 1;
/// The batch ran and at least one item failed; no report was written.
pub const EVALUATION_FAILED: i32 = 2;
