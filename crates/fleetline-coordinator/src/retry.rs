//! Retry Engine — exponential backoff with jitter for transient failures.
//!
//! Callers supply an async operation; the engine retries it up to
//! `max_attempts` times, sleeping an exponentially growing, jittered delay
//! between attempts, and returns a full history of what happened.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use fleetline_core::config::RetryConfig;

/// Outcome of a retry operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The operation succeeded within the configured attempts.
    Success,
    /// All configured attempts failed.
    Exhausted,
    /// The retry loop was aborted before exhausting its attempts.
    Aborted,
}

/// Record of a single attempt.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Wall-clock-independent duration the attempt itself took.
    pub duration: Duration,
    /// Whether this attempt succeeded.
    pub success: bool,
    /// Error description, if the attempt failed.
    pub error: Option<String>,
}

/// Result of a retry operation, including the full attempt history.
#[derive(Debug, Clone)]
pub struct RetryResult {
    /// How the retry loop ended.
    pub outcome: RetryOutcome,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// History of every attempt made.
    pub attempts: Vec<RetryAttempt>,
    /// Total wall-clock duration of the whole retry loop.
    pub total_duration: Duration,
    /// The error from the final attempt, if unsuccessful.
    pub final_error: Option<String>,
}

impl RetryResult {
    /// Number of attempts made.
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }
}

/// Configurable retry policy with exponential backoff and jitter.
///
/// Presets mirror common tunings used elsewhere in this corpus: `default()`
/// for ordinary device connects, `aggressive()` for operations that should
/// retry fast and often, and `patient()` for operations that can tolerate
/// long waits between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    jitter: f64,
    abort: CancellationToken,
}

impl RetryPolicy {
    /// Build a policy from a [`RetryConfig`].
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            backoff_factor: config.backoff_factor,
            jitter: config.jitter,
            abort: CancellationToken::new(),
        }
    }

    /// A policy tuned for quick, frequent retries (5 attempts, 0.5s base,
    /// 5s ceiling, 1.5x growth).
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.5,
            jitter: 0.1,
            abort: CancellationToken::new(),
        }
    }

    /// A policy tuned for operations that can tolerate long waits (3
    /// attempts, 2s base, 30s ceiling, 2x growth).
    pub fn patient() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.1,
            abort: CancellationToken::new(),
        }
    }

    /// A cloneable handle that can signal this policy's in-progress (or
    /// next) retry loop to abort, from another task, while `execute` holds
    /// `&mut self` for the loop's duration.
    ///
    /// ```ignore
    /// let mut policy = RetryPolicy::default();
    /// let abort = policy.abort_handle();
    /// tokio::spawn(async move { abort.cancel() });
    /// policy.execute(attempt).await;
    /// ```
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Signal that the in-progress (or next) retry loop should abort.
    /// Equivalent to calling `.cancel()` on a handle from [`Self::abort_handle`].
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Replace the abort signal with a fresh, uncancelled one so the policy
    /// can be reused for another retry loop.
    pub fn reset(&mut self) {
        self.abort = CancellationToken::new();
    }

    /// Delay to apply before the given attempt (1-based; the first attempt
    /// never waits).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 2) as i32;
        let base = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::random::<f64>() * 2.0 * jitter_range - jitter_range;
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Execute a boolean-returning operation with retries.
    ///
    /// `operation` returns `Ok(true)` on success, `Ok(false)` on a
    /// recoverable failure (retried), or `Err` on a failure whose message is
    /// recorded and also retried.
    pub async fn execute<F, Fut>(&mut self, mut operation: F) -> RetryResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, String>>,
    {
        let mut attempts = Vec::new();
        let start = Instant::now();
        let mut last_error: Option<String> = None;

        for attempt in 1..=self.max_attempts {
            if self.abort.is_cancelled() {
                return RetryResult {
                    outcome: RetryOutcome::Aborted,
                    success: false,
                    attempts,
                    total_duration: start.elapsed(),
                    final_error: Some("retry aborted".to_string()),
                };
            }

            if attempt > 1 {
                let delay = self.delay_for_attempt(attempt);
                tracing::debug!(attempt, max = self.max_attempts, ?delay, "retrying");
                tokio::time::sleep(delay).await;
            }

            let attempt_start = Instant::now();
            let outcome = operation().await;
            let duration = attempt_start.elapsed();

            match outcome {
                Ok(true) => {
                    attempts.push(RetryAttempt {
                        attempt_number: attempt,
                        duration,
                        success: true,
                        error: None,
                    });
                    return RetryResult {
                        outcome: RetryOutcome::Success,
                        success: true,
                        attempts,
                        total_duration: start.elapsed(),
                        final_error: None,
                    };
                }
                Ok(false) => {
                    last_error = Some("operation returned false".to_string());
                    attempts.push(RetryAttempt {
                        attempt_number: attempt,
                        duration,
                        success: false,
                        error: last_error.clone(),
                    });
                }
                Err(message) => {
                    last_error = Some(message.clone());
                    attempts.push(RetryAttempt {
                        attempt_number: attempt,
                        duration,
                        success: false,
                        error: Some(message),
                    });
                }
            }
        }

        RetryResult {
            outcome: RetryOutcome::Exhausted,
            success: false,
            attempts,
            total_duration: start.elapsed(),
            final_error: last_error,
        }
    }

    /// Execute an operation that returns a value, with a caller-supplied
    /// success predicate, retaining the final value in the attempt history.
    ///
    /// Useful when the operation's result carries information beyond
    /// success/failure (e.g. a parsed response), unlike [`Self::execute`]
    /// which only needs a boolean.
    pub async fn execute_with_result<T, F, Fut, IsSuccess>(
        &mut self,
        mut operation: F,
        is_success: IsSuccess,
    ) -> (RetryResult, Option<T>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, String>>,
        IsSuccess: Fn(&T) -> bool,
    {
        let mut attempts = Vec::new();
        let start = Instant::now();
        let mut last_error: Option<String> = None;
        let mut last_value: Option<T> = None;

        for attempt in 1..=self.max_attempts {
            if self.abort.is_cancelled() {
                return (
                    RetryResult {
                        outcome: RetryOutcome::Aborted,
                        success: false,
                        attempts,
                        total_duration: start.elapsed(),
                        final_error: Some("retry aborted".to_string()),
                    },
                    last_value,
                );
            }

            if attempt > 1 {
                tokio::time::sleep(self.delay_for_attempt(attempt)).await;
            }

            let attempt_start = Instant::now();
            let outcome = operation().await;
            let duration = attempt_start.elapsed();

            match outcome {
                Ok(value) => {
                    let success = is_success(&value);
                    attempts.push(RetryAttempt {
                        attempt_number: attempt,
                        duration,
                        success,
                        error: None,
                    });
                    last_value = Some(value);
                    if success {
                        return (
                            RetryResult {
                                outcome: RetryOutcome::Success,
                                success: true,
                                attempts,
                                total_duration: start.elapsed(),
                                final_error: None,
                            },
                            last_value,
                        );
                    }
                    last_error = Some("result check failed".to_string());
                }
                Err(message) => {
                    last_error = Some(message.clone());
                    attempts.push(RetryAttempt {
                        attempt_number: attempt,
                        duration,
                        success: false,
                        error: Some(message),
                    });
                }
            }
        }

        (
            RetryResult {
                outcome: RetryOutcome::Exhausted,
                success: false,
                attempts,
                total_duration: start.elapsed(),
                final_error: last_error,
            },
            last_value,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_for_first_attempt_is_zero() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        });
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_delay_grows_exponentially_without_jitter() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.0,
            max_attempts: 5,
        });
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_is_capped_at_max() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            jitter: 0.0,
            max_attempts: 5,
        });
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_execute_succeeds_on_first_attempt() {
        let mut policy = RetryPolicy::default();
        let result = policy.execute(|| async { Ok(true) }).await;
        assert_eq!(result.outcome, RetryOutcome::Success);
        assert_eq!(result.attempt_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_succeeds_after_retries() {
        tokio::time::pause();
        let mut policy = RetryPolicy::from_config(&RetryConfig {
            jitter: 0.0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        });
        let mut calls = 0;
        let result = policy
            .execute(|| {
                calls += 1;
                let succeed = calls >= 2;
                async move { Ok(succeed) }
            })
            .await;
        assert_eq!(result.outcome, RetryOutcome::Success);
        assert_eq!(result.attempt_count(), 2);
    }

    #[tokio::test]
    async fn test_execute_exhausts_after_max_attempts() {
        tokio::time::pause();
        let mut policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 3,
            jitter: 0.0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
        });
        let result = policy
            .execute(|| async { Err::<bool, _>("always fails".to_string()) })
            .await;
        assert_eq!(result.outcome, RetryOutcome::Exhausted);
        assert_eq!(result.attempt_count(), 3);
        assert_eq!(result.final_error.as_deref(), Some("always fails"));
    }

    #[tokio::test]
    async fn test_execute_respects_abort() {
        let mut policy = RetryPolicy::default();
        policy.abort();
        let result = policy.execute(|| async { Ok(true) }).await;
        assert_eq!(result.outcome, RetryOutcome::Aborted);
        assert_eq!(result.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_handle_cancels_from_another_task_mid_loop() {
        tokio::time::pause();
        let mut policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 5,
            jitter: 0.0,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            ..RetryConfig::default()
        });
        let abort = policy.abort_handle();

        // Policy is held by `execute` below via `&mut self`; a separate task
        // can still cancel it through the cloned handle.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            abort.cancel();
        });

        let result = policy
            .execute(|| async { Ok::<_, String>(false) })
            .await;

        assert_eq!(result.outcome, RetryOutcome::Aborted);
        assert!(result.attempt_count() < 5);
    }

    #[tokio::test]
    async fn test_reset_clears_abort_for_reuse() {
        let mut policy = RetryPolicy::default();
        policy.abort();
        policy.reset();
        let result = policy.execute(|| async { Ok(true) }).await;
        assert_eq!(result.outcome, RetryOutcome::Success);
        assert_eq!(result.attempt_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_with_result_returns_value() {
        tokio::time::pause();
        let mut policy = RetryPolicy::from_config(&RetryConfig {
            jitter: 0.0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        });
        let (result, value) = policy
            .execute_with_result(|| async { Ok::<_, String>(42) }, |v| *v == 42)
            .await;
        assert_eq!(result.outcome, RetryOutcome::Success);
        assert_eq!(value, Some(42));
    }
}
