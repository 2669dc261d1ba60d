//! Stable exit codes for vault CLI commands.

/// Command succeeded, or the awaited request was approved.
pub const OK: i32 = 0;
/// Command failed: missing vault, bad config, unknown request, I/O errors.
pub const INVALID: i32 = 1;
/// `vault request-approval --wait` ended with a rejection.
pub const REJECTED: i32 = 2;
/// `vault request-approval --wait` timed out; the request was cancelled.
pub const TIMED_OUT: i32 = 3;
