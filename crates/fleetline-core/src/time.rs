//! Monotonic time helpers
//!
//! State-machine timestamps (`state_entered_at`, `sent_at`, ...) use
//! [`std::time::Instant`] rather than wall-clock time, since they only ever
//! need to support elapsed-duration comparisons and must not be perturbed by
//! clock adjustments.

use std::time::{Duration, Instant};

/// Elapsed time since `since`, as a `Duration`.
///
/// # Examples
/// ```
/// use fleetline_core::time::elapsed_since;
/// use std::time::Instant;
///
/// let start = Instant::now();
/// let elapsed = elapsed_since(start);
/// assert!(elapsed < std::time::Duration::from_secs(1));
/// ```
pub fn elapsed_since(since: Instant) -> Duration {
    since.elapsed()
}

/// Elapsed time since `since`, in whole milliseconds.
pub fn elapsed_millis(since: Instant) -> u64 {
    elapsed_since(since).as_millis() as u64
}
