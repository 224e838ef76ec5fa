//! Heartbeat Monitor — connection liveness via periodic heartbeat sweeps.
//!
//! A background sweep task compares elapsed time since each instance's last
//! heartbeat against the configured interval, transitioning instances
//! through `Unknown -> Healthy -> Warning -> Unhealthy` and invoking host
//! callbacks on the unhealthy and recovered edges.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fleetline_core::config::HeartbeatConfig;
use fleetline_core::types::InstanceId;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Callback = Arc<dyn Fn(InstanceId, HeartbeatInfo) -> BoxFuture + Send + Sync>;

/// Health status of a monitored instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No heartbeat received yet.
    Unknown,
    /// Heartbeats arriving within the expected interval.
    Healthy,
    /// Some heartbeats missed, below the unhealthy threshold.
    Warning,
    /// Missed heartbeats meet or exceed the unhealthy threshold.
    Unhealthy,
}

/// Heartbeat tracking state for a single instance.
#[derive(Debug, Clone)]
pub struct HeartbeatInfo {
    /// When this instance was registered.
    pub registered_at: Instant,
    /// Timestamp of the most recent heartbeat, if any arrived.
    pub last_heartbeat: Option<Instant>,
    /// Total heartbeats received.
    pub heartbeat_count: u64,
    /// Heartbeats estimated missed since the last received one.
    pub missed_count: u32,
    /// Current health status.
    pub status: HealthStatus,
}

impl HeartbeatInfo {
    fn new() -> Self {
        Self {
            registered_at: Instant::now(),
            last_heartbeat: None,
            heartbeat_count: 0,
            missed_count: 0,
            status: HealthStatus::Unknown,
        }
    }

    fn record_heartbeat(&mut self) {
        self.last_heartbeat = Some(Instant::now());
        self.heartbeat_count += 1;
        self.missed_count = 0;
        self.status = HealthStatus::Healthy;
    }

    /// Time since the last heartbeat, or since registration if none arrived.
    pub fn time_since_last(&self) -> Duration {
        self.last_heartbeat.unwrap_or(self.registered_at).elapsed()
    }

    /// Time since this instance was registered.
    pub fn uptime(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

/// Monitors heartbeats from a fleet of instances and detects unresponsive
/// ones.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    instances: DashMap<InstanceId, HeartbeatInfo>,
    unhealthy_callback: Mutex<Option<Callback>>,
    recovered_callback: Mutex<Option<Callback>>,
    cancel: CancellationToken,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// Create a new monitor from configuration.
    pub fn new(config: HeartbeatConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            instances: DashMap::new(),
            unhealthy_callback: Mutex::new(None),
            recovered_callback: Mutex::new(None),
            cancel: CancellationToken::new(),
            sweep_handle: Mutex::new(None),
        })
    }

    /// Set the callback invoked when an instance crosses into `Unhealthy`.
    pub async fn set_unhealthy_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(InstanceId, HeartbeatInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.unhealthy_callback.lock().await =
            Some(Arc::new(move |id, info| Box::pin(callback(id, info))));
    }

    /// Set the callback invoked when a previously unhealthy instance
    /// receives a heartbeat again.
    pub async fn set_recovered_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(InstanceId, HeartbeatInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.recovered_callback.lock().await =
            Some(Arc::new(move |id, info| Box::pin(callback(id, info))));
    }

    /// Start the periodic sweep task.
    pub async fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let cancel = self.cancel.clone();
        let check_interval = self.config.interval / 2;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.sweep().await,
                    _ = cancel.cancelled() => break,
                }
            }
        });

        *self.sweep_handle.lock().await = Some(handle);
        tracing::info!(interval = ?self.config.interval, timeout = ?self.config.timeout, "heartbeat monitor started");
    }

    /// Stop the sweep task.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            let _ = handle.await;
        }
        tracing::info!("heartbeat monitor stopped");
    }

    /// Register an instance for monitoring. Idempotent.
    pub fn register(&self, instance_id: InstanceId) {
        self.instances.entry(instance_id).or_insert_with(HeartbeatInfo::new);
    }

    /// Stop monitoring an instance.
    pub fn unregister(&self, instance_id: &InstanceId) {
        self.instances.remove(instance_id);
    }

    /// Record a heartbeat from an instance, auto-registering it if unknown.
    /// If the instance was unhealthy, spawns the recovered callback.
    pub async fn on_heartbeat(&self, instance_id: InstanceId) {
        let was_unhealthy = {
            let mut entry = self
                .instances
                .entry(instance_id.clone())
                .or_insert_with(HeartbeatInfo::new);
            let was_unhealthy = entry.status == HealthStatus::Unhealthy;
            entry.record_heartbeat();
            was_unhealthy
        };

        if was_unhealthy {
            tracing::info!(%instance_id, "instance recovered");
            let callback = self.recovered_callback.lock().await.clone();
            if let Some(callback) = callback {
                let info = self.get_info(&instance_id).expect("just recorded");
                let callback_timeout = self.config.callback_timeout;
                tokio::spawn(async move {
                    if tokio::time::timeout(callback_timeout, callback(instance_id, info))
                        .await
                        .is_err()
                    {
                        tracing::warn!("recovered callback timed out");
                    }
                });
            }
        }
    }

    /// Current health status of an instance.
    pub fn get_status(&self, instance_id: &InstanceId) -> HealthStatus {
        self.instances
            .get(instance_id)
            .map(|i| i.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Full heartbeat info for an instance.
    pub fn get_info(&self, instance_id: &InstanceId) -> Option<HeartbeatInfo> {
        self.instances.get(instance_id).map(|i| i.clone())
    }

    /// Health status of every monitored instance.
    pub fn all_statuses(&self) -> HashMap<InstanceId, HealthStatus> {
        self.instances
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status))
            .collect()
    }

    /// IDs of all currently unhealthy instances.
    pub fn unhealthy_instances(&self) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|entry| entry.value().status == HealthStatus::Unhealthy)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Whether an instance is currently healthy.
    pub fn is_healthy(&self, instance_id: &InstanceId) -> bool {
        self.get_status(instance_id) == HealthStatus::Healthy
    }

    async fn sweep(&self) {
        let snapshot: Vec<InstanceId> = self.instances.iter().map(|e| e.key().clone()).collect();

        for instance_id in snapshot {
            let Some(mut entry) = self.instances.get_mut(&instance_id) else {
                continue;
            };

            let time_since = entry.time_since_last();
            let expected_missed = (time_since.as_secs_f64() / self.config.interval.as_secs_f64()) as u32;
            let previous_status = entry.status;

            if expected_missed >= self.config.unhealthy_threshold {
                entry.status = HealthStatus::Unhealthy;
                entry.missed_count = expected_missed;
            } else if expected_missed >= self.config.warning_threshold {
                entry.status = HealthStatus::Warning;
                entry.missed_count = expected_missed;
            } else if entry.last_heartbeat.is_some() {
                entry.status = HealthStatus::Healthy;
            }

            let became_unhealthy =
                entry.status == HealthStatus::Unhealthy && previous_status != HealthStatus::Unhealthy;
            let info = entry.clone();
            drop(entry);

            if became_unhealthy {
                tracing::warn!(%instance_id, missed = info.missed_count, "instance unhealthy");
                let callback = self.unhealthy_callback.lock().await.clone();
                if let Some(callback) = callback {
                    let callback_timeout = self.config.callback_timeout;
                    let instance_id = instance_id.clone();
                    tokio::spawn(async move {
                        if tokio::time::timeout(callback_timeout, callback(instance_id, info))
                            .await
                            .is_err()
                        {
                            tracing::warn!("unhealthy callback timed out");
                        }
                    });
                }
            }
        }
    }
}
