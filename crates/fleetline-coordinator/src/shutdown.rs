//! Shutdown Orchestrator — multi-phase graceful teardown of a child process.
//!
//! Drives a single instance through `Unassigning -> WaitingAck -> Quitting`,
//! escalating to `Terminating -> Killing` only if the child fails to exit
//! within its timeout, then `Draining` its stdio pipes before declaring
//! `Complete`.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, Mutex};

use fleetline_core::config::ShutdownTimeouts;
use fleetline_core::traits::ManagedProcess;

/// Phase reached during a shutdown attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// No shutdown in progress.
    Idle,
    /// Requesting the child release any assigned devices.
    Unassigning,
    /// Waiting for the unassign acknowledgment.
    WaitingAck,
    /// Waiting for the child to exit after a polite quit command.
    Quitting,
    /// Waiting for the child to exit after SIGTERM.
    Terminating,
    /// Waiting for the child to exit after SIGKILL.
    Killing,
    /// Draining the child's stdio pipes.
    Draining,
    /// Shutdown finished.
    Complete,
}

/// Result of a shutdown attempt.
#[derive(Debug, Clone)]
pub struct ShutdownResult {
    /// Whether shutdown completed without an uncaught failure.
    pub success: bool,
    /// Whether the child acknowledged the unassign request.
    pub acknowledged: bool,
    /// Whether escalation past a polite quit was required.
    pub forced: bool,
    /// Total duration of the shutdown attempt.
    pub duration: Duration,
    /// The furthest phase reached.
    pub phase_reached: ShutdownPhase,
    /// Error description, if `success` is false.
    pub error: Option<String>,
}

impl ShutdownResult {
    /// True if the child acknowledged the unassign request and no
    /// escalation past a polite quit was needed.
    pub fn was_graceful(&self) -> bool {
        self.acknowledged && !self.forced
    }
}

/// Coordinates the unassign/quit/terminate/kill/drain ladder for a single
/// child process.
pub struct ShutdownOrchestrator {
    timeouts: ShutdownTimeouts,
    pending_acks: Mutex<HashMap<String, oneshot::Sender<Option<serde_json::Value>>>>,
}

impl ShutdownOrchestrator {
    /// Create an orchestrator with the given phase timeouts.
    pub fn new(timeouts: ShutdownTimeouts) -> Self {
        Self {
            timeouts,
            pending_acks: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a correlation id for an unassign request.
    pub fn generate_command_id(&self) -> String {
        format!("shutdown-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
    }

    /// Resolve a pending unassign acknowledgment. Returns `true` if a
    /// pending request matched.
    pub async fn on_device_unassigned(
        &self,
        command_id: &str,
        data: Option<serde_json::Value>,
    ) -> bool {
        let sender = self.pending_acks.lock().await.remove(command_id);
        match sender {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    async fn request_device_unassign<F, Fut>(
        &self,
        command_id: String,
        send_fn: F,
    ) -> (bool, Option<serde_json::Value>)
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(command_id.clone(), tx);

        if let Err(e) = send_fn(command_id.clone()).await {
            tracing::warn!(error = %e, "failed to send unassign request");
            self.pending_acks.lock().await.remove(&command_id);
            return (false, None);
        }

        match tokio::time::timeout(self.timeouts.unassign_ack, rx).await {
            Ok(Ok(data)) => (true, data),
            _ => {
                self.pending_acks.lock().await.remove(&command_id);
                (false, None)
            }
        }
    }

    async fn drain_pipes(&self, process: &mut dyn ManagedProcess) {
        let timeout = self.timeouts.drain;
        let stdout = process.stdout();
        let stderr = process.stderr();

        let drain_one = |stream: Option<&mut (dyn tokio::io::AsyncRead + Send + Unpin)>| async move {
            let Some(stream) = stream else { return };
            let mut buf = [0u8; 4096];
            loop {
                match tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf)).await {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Ok(_)) => continue,
                    Ok(Err(_)) => break,
                }
            }
        };

        let _ = tokio::time::timeout(timeout, async {
            // stdout and stderr drain concurrently; neither depends on the other.
            tokio::join!(drain_one(stdout), drain_one(stderr));
        })
        .await;
    }

    /// Run the full shutdown ladder for `process`.
    ///
    /// `unassign_fn` sends the unassign-all-devices command given a
    /// correlation id; `quit_fn` sends a polite quit command.
    pub async fn shutdown_process<UnassignFn, UnassignFut, QuitFn, QuitFut>(
        &self,
        process: &mut dyn ManagedProcess,
        unassign_fn: UnassignFn,
        quit_fn: QuitFn,
    ) -> ShutdownResult
    where
        UnassignFn: FnOnce(String) -> UnassignFut,
        UnassignFut: Future<Output = anyhow::Result<()>>,
        QuitFn: FnOnce() -> QuitFut,
        QuitFut: Future<Output = anyhow::Result<()>>,
    {
        let start = Instant::now();
        let mut phase = ShutdownPhase::Idle;

        let result = async {
            phase = ShutdownPhase::Unassigning;
            let command_id = self.generate_command_id();
            phase = ShutdownPhase::WaitingAck;
            let (acknowledged, ack_data) = self.request_device_unassign(command_id, unassign_fn).await;
            if let Some(data) = &ack_data {
                tracing::debug!(?data, "device unassign acknowledged");
            }

            phase = ShutdownPhase::Quitting;
            if let Err(e) = quit_fn().await {
                tracing::warn!(error = %e, "failed to send quit command, escalating");
            }

            let mut forced = false;

            if tokio::time::timeout(self.timeouts.quit, process.wait()).await.is_err() {
                forced = true;
                phase = ShutdownPhase::Terminating;
                if let Err(e) = process.terminate() {
                    tracing::warn!(error = %e, "terminate failed, escalating to kill");
                }

                if tokio::time::timeout(self.timeouts.terminate, process.wait())
                    .await
                    .is_err()
                {
                    phase = ShutdownPhase::Killing;
                    if let Err(e) = process.kill().await {
                        return Err(format!("kill failed: {e}"));
                    }
                }
            }

            phase = ShutdownPhase::Draining;
            self.drain_pipes(process).await;

            phase = ShutdownPhase::Complete;
            Ok((acknowledged, forced))
        }
        .await;

        match result {
            Ok((acknowledged, forced)) => ShutdownResult {
                success: true,
                acknowledged,
                forced,
                duration: start.elapsed(),
                phase_reached: phase,
                error: None,
            },
            Err(message) => ShutdownResult {
                success: false,
                acknowledged: false,
                forced: phase as u8 >= ShutdownPhase::Terminating as u8,
                duration: start.elapsed(),
                phase_reached: phase,
                error: Some(message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncRead;

    struct FakeProcess {
        exits_after: Option<Duration>,
        spawned_at: Instant,
        terminated: Arc<AtomicBool>,
        killed: Arc<AtomicU32>,
    }

    impl FakeProcess {
        fn new(exits_after: Option<Duration>) -> Self {
            Self {
                exits_after,
                spawned_at: Instant::now(),
                terminated: Arc::new(AtomicBool::new(false)),
                killed: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl ManagedProcess for FakeProcess {
        async fn wait(&mut self) -> std::io::Result<Option<i32>> {
            match self.exits_after {
                Some(d) => {
                    let elapsed = self.spawned_at.elapsed();
                    if elapsed < d {
                        tokio::time::sleep(d - elapsed).await;
                    }
                    Ok(Some(0))
                }
                None => std::future::pending().await,
            }
        }

        fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
            Ok(None)
        }

        fn terminate(&mut self) -> std::io::Result<()> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn kill(&mut self) -> std::io::Result<()> {
            self.killed.fetch_add(1, Ordering::SeqCst);
            self.exits_after = Some(Duration::ZERO);
            self.spawned_at = Instant::now();
            Ok(())
        }

        fn stdout(&mut self) -> Option<&mut (dyn AsyncRead + Send + Unpin)> {
            None
        }

        fn stderr(&mut self) -> Option<&mut (dyn AsyncRead + Send + Unpin)> {
            None
        }
    }

    fn fast_timeouts() -> ShutdownTimeouts {
        ShutdownTimeouts {
            unassign_ack: Duration::from_millis(20),
            quit: Duration::from_millis(20),
            terminate: Duration::from_millis(20),
            drain: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_shutdown_completes_gracefully_on_quit() {
        let orchestrator = ShutdownOrchestrator::new(fast_timeouts());
        let mut process = FakeProcess::new(Some(Duration::from_millis(1)));

        let result = orchestrator
            .shutdown_process(
                &mut process,
                |_id| async { Ok(()) },
                || async { Ok(()) },
            )
            .await;

        assert!(result.success);
        assert!(!result.forced);
        assert_eq!(result.phase_reached, ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_terminate_when_quit_times_out() {
        let orchestrator = ShutdownOrchestrator::new(fast_timeouts());
        let mut process = FakeProcess::new(None);
        let terminated = Arc::clone(&process.terminated);

        let result = orchestrator
            .shutdown_process(
                &mut process,
                |_id| async { Ok(()) },
                || async { Ok(()) },
            )
            .await;

        assert!(result.success);
        assert!(result.forced);
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_escalates_when_quit_send_fails() {
        let orchestrator = ShutdownOrchestrator::new(fast_timeouts());
        let mut process = FakeProcess::new(None);
        let terminated = Arc::clone(&process.terminated);

        let result = orchestrator
            .shutdown_process(
                &mut process,
                |_id| async { Ok(()) },
                || async { Err(anyhow::anyhow!("pipe closed")) },
            )
            .await;

        assert!(result.success);
        assert!(result.forced);
        assert!(terminated.load(Ordering::SeqCst));
        assert_eq!(result.phase_reached, ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_on_device_unassigned_resolves_pending_ack() {
        let orchestrator = Arc::new(ShutdownOrchestrator::new(ShutdownTimeouts {
            unassign_ack: Duration::from_secs(5),
            ..fast_timeouts()
        }));
        let mut process = FakeProcess::new(Some(Duration::from_millis(1)));

        let orchestrator_clone = Arc::clone(&orchestrator);
        let result = orchestrator
            .shutdown_process(
                &mut process,
                move |command_id| {
                    let orchestrator = Arc::clone(&orchestrator_clone);
                    async move {
                        tokio::spawn(async move {
                            tokio::task::yield_now().await;
                            orchestrator.on_device_unassigned(&command_id, None).await;
                        });
                        Ok(())
                    }
                },
                || async { Ok(()) },
            )
            .await;

        assert!(result.acknowledged);
        assert!(result.was_graceful());
    }
}
