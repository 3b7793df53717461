//! Stable exit codes for the `repair` CLI.

/// A patch was produced and the final spoke terminated successfully.
pub const OK: i32 = 0;
/// Invalid usage or config, or an environment fault aborted the run.
pub const INVALID: i32 = 1;
/// The final spoke produced no patch.
pub const NO_PATCH: i32 = 2;
/// A patch exists but the final spoke did not terminate successfully.
pub const UNVALIDATED: i32 = 3;
