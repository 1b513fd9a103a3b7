//! Bounded retry policy for work retried across scheduler cycles

use std::io;

/// Retry budget for an operation retried once per cycle.
///
/// Unlike an in-place backoff loop, the caller keeps the attempt counter and asks
/// the policy after each failure whether another cycle is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one. Zero is treated as one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// True when `attempts` failed attempts leave no budget for another one.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts.max(1)
    }
}

/// Whether an I/O failure may go away on a later cycle.
///
/// Permission and invalid-input errors need an operator; everything else
/// (full disk, busy files, races with concurrent writers) is worth retrying.
pub fn is_transient(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput
    )
}
