//! Stable exit codes for `dagrun` commands.

/// Command succeeded; for `run`, the root reached a final outcome.
pub const OK: i32 = 0;
/// Usage, config or store error (unknown node, illegal transition, lock held).
pub const INVALID: i32 = 1;
/// `dagrun validate` found structural errors.
pub const VALIDATION_FAILED: i32 = 2;
/// `dagrun run` stopped on a contract violation, lost claim race or I/O failure.
pub const RUN_ERROR: i32 = 3;
/// `dagrun run` stopped before the root was final (no executable leaf or step
/// budget exhausted).
pub const NOT_FINAL: i32 = 4;
