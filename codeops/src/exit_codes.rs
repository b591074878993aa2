//! Stable exit codes for the `codeops` CLI.

/// Command succeeded (for `run`: the build passed).
pub const OK: i32 = 0;
/// The pipeline ran but ended in `status=error`.
pub const RUN_FAILED: i32 = 1;
/// Bad input or configuration; nothing was run.
pub const INVALID: i32 = 2;
