//! Stable exit codes for checkloop CLI commands.

/// Command succeeded; for `validate`, the loop should continue.
pub const OK: i32 = 0;
/// Invalid config, invalid state, or any other error.
pub const INVALID: i32 = 1;
/// `next` would exceed `maxIterations`.
pub const LIMIT_EXCEEDED: i32 = 2;
/// `validate` signalled BLOCKED, or quality gates / completion checks failed.
pub const BLOCKED: i32 = 3;
/// `validate` signalled COMPLETE.
pub const COMPLETE: i32 = 4;
