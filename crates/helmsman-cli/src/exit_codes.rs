//! Process exit codes

/// Success; with `--detailed-exit-code`, also means no changes were planned
pub const SUCCESS: i32 = 0;

/// Any fatal error
pub const ERROR: i32 = 1;

/// Success with planned or applied changes (only under `--detailed-exit-code`)
pub const CHANGES: i32 = 2;
