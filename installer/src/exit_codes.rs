//! Stable exit codes for installer CLI commands.

/// Command finished. Individual hosts may still have failed; see the summary.
pub const OK: i32 = 0;
/// Command aborted: missing inventory/artifact, unknown section, bad config.
pub const INVALID: i32 = 1;
