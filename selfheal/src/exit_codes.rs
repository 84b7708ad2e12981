//! Stable exit codes for `selfheal` CLI commands.

/// Program runs (or review finished), or the operator declined to proceed.
pub const OK: i32 = 0;
/// Invalid config, launch failure, or any other unrecovered error.
pub const INVALID: i32 = 1;
/// Retry budget exhausted; human intervention required.
pub const EXHAUSTED: i32 = 2;
/// Server never became reachable, so health could not be verified.
pub const UNVERIFIED: i32 = 3;
/// Stopped by keyboard interrupt.
pub const CANCELLED: i32 = 130;
