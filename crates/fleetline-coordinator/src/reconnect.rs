//! Reconnecting Read-Loop pattern — a passive collaborator for device read
//! loops, not used by the Connection Coordinator itself.
//!
//! A device handler that tracks its own `consecutive_errors` can embed a
//! [`ReconnectTracker`] and implement [`ReconnectingReadLoop`] to replace a
//! hard circuit-breaker exit with bounded, backed-off reconnection attempts.

use std::time::Duration;

use async_trait::async_trait;

/// Current phase of a read loop's reconnection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    /// Transport is up and the read loop is operating normally.
    Connected,
    /// A reconnect attempt is in flight.
    Reconnecting,
    /// Reconnection attempts were exhausted; the read loop should exit.
    Failed,
}

/// Backoff and threshold tuning for the reconnecting read loop.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Consecutive read/write errors before the circuit breaker triggers.
    pub max_consecutive_errors: u32,
    /// Reconnect attempts to make before giving up permanently.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Ceiling on the computed delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay for each successive attempt.
    pub backoff_factor: f64,
    /// Jitter fraction applied on top of the computed delay.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 10,
            max_reconnect_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

/// Reconnection bookkeeping a read loop embeds alongside its own state.
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    config: ReconnectConfig,
    state: ReconnectState,
    attempt: u32,
}

impl ReconnectTracker {
    /// Create a tracker in the `Connected` state.
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ReconnectState::Connected,
            attempt: 0,
        }
    }

    /// Current reconnection phase.
    pub fn state(&self) -> ReconnectState {
        self.state
    }

    /// Whether a reconnect attempt is currently in flight.
    pub fn is_reconnecting(&self) -> bool {
        self.state == ReconnectState::Reconnecting
    }

    /// Whether reconnection has permanently failed.
    pub fn has_failed(&self) -> bool {
        self.state == ReconnectState::Failed
    }

    /// Number of reconnect attempts made in the current reconnection cycle.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Consecutive-error threshold that should trigger
    /// [`ReconnectingReadLoop::run_circuit_breaker`].
    pub fn max_consecutive_errors(&self) -> u32 {
        self.config.max_consecutive_errors
    }

    /// Reset to `Connected` with no attempts recorded, e.g. after a manual
    /// reconnect outside the circuit breaker.
    pub fn reset(&mut self) {
        self.state = ReconnectState::Connected;
        self.attempt = 0;
    }

    fn delay_for_next_attempt(&self) -> Duration {
        let exponent = self.attempt.saturating_sub(1) as i32;
        let base = self.config.base_delay.as_secs_f64() * self.config.backoff_factor.powi(exponent);
        let capped = base.min(self.config.max_delay.as_secs_f64());
        let jittered = capped + capped * self.config.jitter * rand::random::<f64>();
        Duration::from_secs_f64(jittered)
    }
}

/// Implemented by a device read loop that wants auto-reconnect instead of a
/// permanent exit once its consecutive-error count reaches
/// [`ReconnectConfig::max_consecutive_errors`].
///
/// Only [`Self::reconnect_tracker`], [`Self::attempt_reconnect`], and
/// [`Self::reset_error_counter`] need implementing; `run_circuit_breaker` is
/// provided.
#[async_trait]
pub trait ReconnectingReadLoop: Send {
    /// Mutable access to the embedded tracker.
    fn reconnect_tracker(&mut self) -> &mut ReconnectTracker;

    /// Attempt to reestablish the underlying transport.
    async fn attempt_reconnect(&mut self) -> bool;

    /// Reset whatever consecutive-error counter the read loop maintains.
    /// Called unconditionally on a successful reconnect.
    fn reset_error_counter(&mut self);

    /// Drive the backoff ladder until a reconnect succeeds or
    /// `max_reconnect_attempts` is exhausted. Call this once the read loop's
    /// own error counter reaches [`ReconnectTracker::max_consecutive_errors`].
    ///
    /// Returns `true` if the loop should continue (reconnected), `false` if
    /// it should exit (reconnection permanently failed). Iterative rather
    /// than the original's recursive retry, since an async trait default
    /// method recursing into itself would require boxing each frame.
    async fn run_circuit_breaker(&mut self) -> bool {
        loop {
            let delay = {
                let tracker = self.reconnect_tracker();
                if tracker.attempt >= tracker.config.max_reconnect_attempts {
                    tracker.state = ReconnectState::Failed;
                    tracing::error!(
                        attempts = tracker.attempt,
                        "reconnection exhausted, giving up"
                    );
                    return false;
                }
                tracker.state = ReconnectState::Reconnecting;
                tracker.attempt += 1;
                tracker.delay_for_next_attempt()
            };

            let (attempt, max_attempts) = {
                let tracker = self.reconnect_tracker();
                (tracker.attempt, tracker.config.max_reconnect_attempts)
            };
            tracing::info!(attempt, max_attempts, ?delay, "attempting reconnect");
            tokio::time::sleep(delay).await;

            if self.attempt_reconnect().await {
                self.reset_error_counter();
                let tracker = self.reconnect_tracker();
                tracker.state = ReconnectState::Connected;
                tracker.attempt = 0;
                tracing::info!("reconnected successfully");
                return true;
            }

            tracing::warn!(attempt, "reconnect attempt failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeReadLoop {
        tracker: ReconnectTracker,
        succeeds_on_attempt: u32,
        error_resets: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ReconnectingReadLoop for FakeReadLoop {
        fn reconnect_tracker(&mut self) -> &mut ReconnectTracker {
            &mut self.tracker
        }

        async fn attempt_reconnect(&mut self) -> bool {
            self.tracker.attempt >= self.succeeds_on_attempt
        }

        fn reset_error_counter(&mut self) {
            self.error_resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
            ..ReconnectConfig::default()
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_succeeds_after_retries() {
        let error_resets = Arc::new(AtomicU32::new(0));
        let mut read_loop = FakeReadLoop {
            tracker: ReconnectTracker::new(fast_config()),
            succeeds_on_attempt: 3,
            error_resets: Arc::clone(&error_resets),
        };

        let reconnected = read_loop.run_circuit_breaker().await;

        assert!(reconnected);
        assert_eq!(read_loop.tracker.state(), ReconnectState::Connected);
        assert_eq!(read_loop.tracker.attempt(), 0);
        assert_eq!(error_resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_fails_after_exhausting_attempts() {
        let mut read_loop = FakeReadLoop {
            tracker: ReconnectTracker::new(ReconnectConfig {
                max_reconnect_attempts: 3,
                ..fast_config()
            }),
            succeeds_on_attempt: 100,
            error_resets: Arc::new(AtomicU32::new(0)),
        };

        let reconnected = read_loop.run_circuit_breaker().await;

        assert!(!reconnected);
        assert_eq!(read_loop.tracker.state(), ReconnectState::Failed);
    }

    #[test]
    fn test_reset_clears_state_and_attempt() {
        let mut tracker = ReconnectTracker::new(fast_config());
        tracker.state = ReconnectState::Reconnecting;
        tracker.attempt = 4;
        tracker.reset();
        assert_eq!(tracker.state(), ReconnectState::Connected);
        assert_eq!(tracker.attempt(), 0);
    }
}
