//! Command Tracker — reliable command delivery with correlation ids.
//!
//! Every command sent to a child gets a unique correlation id and a pending
//! completion handle. The child's eventual response (or a timeout, or the
//! tracker being stopped) resolves the handle exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fleetline_core::error::CommandError;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of a tracked command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    /// Whether the child reported success.
    pub success: bool,
    /// Arbitrary response payload, when the child included one.
    pub data: Option<serde_json::Value>,
    /// Error description, when `success` is false.
    pub error: Option<String>,
    /// Time elapsed between send and resolution.
    pub duration: Duration,
}

impl CommandResult {
    fn timeout(duration: Duration) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(CommandError::TimedOut.to_string()),
            duration,
        }
    }

    fn tracker_stopped() -> Self {
        Self {
            success: false,
            data: None,
            error: Some(CommandError::TrackerStopped.to_string()),
            duration: Duration::ZERO,
        }
    }
}

struct Pending {
    command_type: String,
    device_id: Option<String>,
    sent_at: Instant,
    timeout: Duration,
    completion: oneshot::Sender<CommandResult>,
}

impl Pending {
    fn is_expired(&self) -> bool {
        self.sent_at.elapsed() > self.timeout
    }

    fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }
}

struct Inner {
    pending: HashMap<String, Pending>,
}

/// Tracks commands sent to children and matches them with responses.
pub struct CommandTracker {
    inner: Mutex<Inner>,
    cleanup_cancel: CancellationToken,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CommandTracker {
    /// Create a new, unstarted tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
            }),
            cleanup_cancel: CancellationToken::new(),
            cleanup_handle: Mutex::new(None),
        })
    }

    /// Start the background task that resolves expired commands as timeouts.
    pub async fn start(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        let cancel = self.cleanup_cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tracker.expire_stale().await,
                    _ = cancel.cancelled() => break,
                }
            }
        });
        *self.cleanup_handle.lock().await = Some(handle);
        tracing::debug!("command tracker started");
    }

    /// Stop the tracker: cancel the cleanup task and fail every pending
    /// command with [`CommandError::TrackerStopped`].
    pub async fn stop(&self) {
        self.cleanup_cancel.cancel();
        if let Some(handle) = self.cleanup_handle.lock().await.take() {
            let _ = handle.await;
        }

        let mut inner = self.inner.lock().await;
        for (_, pending) in inner.pending.drain() {
            let _ = pending.completion.send(CommandResult::tracker_stopped());
        }
        tracing::debug!("command tracker stopped");
    }

    /// Generate a correlation id: the first 8 hex characters of a UUIDv4.
    pub fn generate_command_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
    }

    /// Register a command as pending, send it via `send_fn`, and await its
    /// resolution or timeout.
    pub async fn send_and_wait<F, Fut>(
        &self,
        command_id: String,
        command_type: impl Into<String>,
        device_id: Option<String>,
        timeout: Duration,
        send_fn: F,
    ) -> CommandResult
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let (tx, rx) = oneshot::channel();
        let sent_at = Instant::now();

        {
            let mut inner = self.inner.lock().await;
            inner.pending.insert(
                command_id.clone(),
                Pending {
                    command_type: command_type.into(),
                    device_id,
                    sent_at,
                    timeout,
                    completion: tx,
                },
            );
        }

        let result = if let Err(e) = send_fn().await {
            self.remove(&command_id).await;
            CommandResult {
                success: false,
                data: None,
                error: Some(e.to_string()),
                duration: sent_at.elapsed(),
            }
        } else {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => CommandResult::tracker_stopped(),
                Err(_) => {
                    tracing::warn!(command_id = %command_id, ?timeout, "command timed out");
                    CommandResult::timeout(sent_at.elapsed())
                }
            }
        };

        self.remove(&command_id).await;
        result
    }

    async fn remove(&self, command_id: &str) {
        self.inner.lock().await.pending.remove(command_id);
    }

    /// Resolve a pending command with an explicit success/failure response.
    /// Returns `true` if a pending command matched.
    pub async fn on_response(
        &self,
        command_id: &str,
        success: bool,
        data: Option<serde_json::Value>,
        error: Option<String>,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending.remove(command_id) else {
            tracing::debug!(command_id, "no pending command for response");
            return false;
        };

        let duration = pending.elapsed();
        let result = CommandResult {
            success,
            data,
            error,
            duration,
        };

        if pending.completion.send(result).is_err() {
            tracing::debug!(command_id, "command already resolved");
            return false;
        }

        tracing::debug!(command_id, success, ?duration, "command resolved");
        true
    }

    /// Resolve the pending `assign_device` command for a device as
    /// successful, used when a child reports readiness spontaneously.
    pub async fn on_device_ready(&self, device_id: &str, data: Option<serde_json::Value>) -> bool {
        let command_id = {
            let inner = self.inner.lock().await;
            inner
                .pending
                .iter()
                .find(|(_, p)| p.device_id.as_deref() == Some(device_id) && p.command_type == "assign_device")
                .map(|(id, _)| id.clone())
        };

        match command_id {
            Some(id) => self.on_response(&id, true, data, None).await,
            None => {
                tracing::debug!(device_id, "no pending assign_device for device_ready");
                false
            }
        }
    }

    /// Resolve the pending `assign_device` command for a device as failed.
    pub async fn on_device_error(
        &self,
        device_id: &str,
        error: String,
        data: Option<serde_json::Value>,
    ) -> bool {
        let command_id = {
            let inner = self.inner.lock().await;
            inner
                .pending
                .iter()
                .find(|(_, p)| p.device_id.as_deref() == Some(device_id) && p.command_type == "assign_device")
                .map(|(id, _)| id.clone())
        };

        match command_id {
            Some(id) => self.on_response(&id, false, data, Some(error)).await,
            None => {
                tracing::debug!(device_id, "no pending assign_device for device_error");
                false
            }
        }
    }

    /// Number of currently pending commands.
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    async fn expire_stale(&self) {
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .pending
            .iter()
            .filter(|(_, p)| p.is_expired())
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(pending) = inner.pending.remove(&id) {
                let duration = pending.elapsed();
                let _ = pending.completion.send(CommandResult::timeout(duration));
                tracing::debug!(command_id = %id, "expired command");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_wait_resolves_on_response() {
        let tracker = CommandTracker::new();
        tracker.start().await;

        let command_id = tracker.generate_command_id();
        let id_for_send = command_id.clone();
        let tracker_for_response = Arc::clone(&tracker);
        let response_id = command_id.clone();

        let (result, _) = tokio::join!(
            tracker.send_and_wait(
                command_id,
                "assign_device",
                Some("ACM0".to_string()),
                Duration::from_secs(5),
                move || async move {
                    let _ = id_for_send;
                    Ok(())
                },
            ),
            async move {
                tokio::task::yield_now().await;
                tracker_for_response
                    .on_response(&response_id, true, None, None)
                    .await;
            }
        );

        assert!(result.success);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_send_and_wait_times_out() {
        tokio::time::pause();
        let tracker = CommandTracker::new();
        tracker.start().await;

        let command_id = tracker.generate_command_id();
        let result = tracker
            .send_and_wait(
                command_id,
                "assign_device",
                Some("ACM0".to_string()),
                Duration::from_millis(10),
                || async { Ok(()) },
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("command timed out"));
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_on_response_without_pending_returns_false() {
        let tracker = CommandTracker::new();
        assert!(!tracker.on_response("unknown", true, None, None).await);
    }

    #[tokio::test]
    async fn test_on_device_ready_matches_pending_assign_device() {
        let tracker = CommandTracker::new();
        tracker.start().await;

        let command_id = tracker.generate_command_id();
        let tracker_clone = Arc::clone(&tracker);

        let (result, _) = tokio::join!(
            tracker.send_and_wait(
                command_id,
                "assign_device",
                Some("ACM0".to_string()),
                Duration::from_secs(5),
                || async { Ok(()) },
            ),
            async move {
                tokio::task::yield_now().await;
                tracker_clone.on_device_ready("ACM0", None).await;
            }
        );

        assert!(result.success);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_fails_pending_commands() {
        tokio::time::pause();
        let tracker = CommandTracker::new();
        tracker.start().await;

        let command_id = tracker.generate_command_id();
        let tracker_clone = Arc::clone(&tracker);

        let (result, _) = tokio::join!(
            tracker.send_and_wait(
                command_id,
                "assign_device",
                None,
                Duration::from_secs(60),
                || async { Ok(()) },
            ),
            async move {
                tokio::task::yield_now().await;
                tracker_clone.stop().await;
            }
        );

        assert!(!result.success);
    }
}
