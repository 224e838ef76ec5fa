//! Connection Coordinator — owns the per-instance state machine and is the
//! sole writer of connection state.
//!
//! Drives the Retry Engine, Command Tracker, and Heartbeat Monitor on behalf
//! of each `(module, device)` instance, and is the only component that
//! notifies observers of state changes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Mutex;

use fleetline_core::config::CoordinatorConfig;
use fleetline_core::traits::ChildController;
use fleetline_core::types::InstanceId;

use crate::command_tracker::CommandTracker;
use crate::heartbeat::{HeartbeatInfo, HeartbeatMonitor};
use crate::retry::RetryPolicy;

/// State of a module connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No process, no device.
    Disconnected,
    /// Process spawn requested, not yet confirmed alive.
    Starting,
    /// Process alive and healthy, no device attached.
    Running,
    /// A device assign command is in flight, possibly retrying.
    Connecting,
    /// Device assigned and streaming.
    Connected,
    /// A device unassign is in flight.
    Disconnecting,
    /// Process teardown requested.
    Stopping,
    /// Process crashed or retries were exhausted.
    Failed,
}

/// Events that trigger state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// Host asked the coordinator to spawn the process.
    StartRequested,
    /// `start_fn` returned and the process has been handed to the OS.
    ProcessStarted,
    /// The process is considered ready to accept commands.
    ProcessReady,
    /// Host asked the coordinator to assign a device.
    ConnectRequested,
    /// The device reported readiness.
    DeviceReady,
    /// The device reported an error while assigning.
    DeviceError,
    /// Host asked the coordinator to release the device.
    DisconnectRequested,
    /// The device confirmed release.
    DeviceDisconnected,
    /// Host asked the coordinator to stop the instance.
    StopRequested,
    /// The process exited on request.
    ProcessStopped,
    /// The process exited unexpectedly.
    ProcessCrashed,
    /// The heartbeat monitor declared the instance unhealthy.
    HeartbeatTimeout,
    /// The retry engine exhausted all connect attempts.
    RetryExhausted,
}

/// Allowed `(state, event) -> state` transitions.
///
/// Extends the distilled table with `(Failed, ConnectRequested) -> Connecting`
/// — see `DESIGN.md` for why: the original always attempts the transition
/// from `RUNNING` or `FAILED` alike, and `connect_device`'s own contract says
/// it accepts both starting states.
fn allowed_transition(state: ConnectionState, event: ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionEvent::*;
    use ConnectionState::*;

    match (state, event) {
        (Disconnected, StartRequested) => Some(Starting),
        (Starting, ProcessStarted) => Some(Starting),
        (Starting, ProcessReady) => Some(Running),
        (Starting, ProcessCrashed) => Some(Failed),
        (Running, ConnectRequested) => Some(Connecting),
        (Failed, ConnectRequested) => Some(Connecting),
        (Connecting, DeviceReady) => Some(Connected),
        (Connecting, DeviceError) => Some(Running),
        (Connecting, RetryExhausted) => Some(Failed),
        (Connected, DisconnectRequested) => Some(Disconnecting),
        (Disconnecting, DeviceDisconnected) => Some(Running),
        (Running, StopRequested) => Some(Stopping),
        (Connected, StopRequested) => Some(Stopping),
        (Connecting, StopRequested) => Some(Stopping),
        (Stopping, ProcessStopped) => Some(Disconnected),
        (Running, ProcessCrashed) => Some(Failed),
        (Connecting, ProcessCrashed) => Some(Failed),
        (Connected, ProcessCrashed) => Some(Failed),
        (Disconnecting, ProcessCrashed) => Some(Failed),
        (Stopping, ProcessCrashed) => Some(Disconnected),
        (Connected, HeartbeatTimeout) => Some(Failed),
        (Failed, StartRequested) => Some(Starting),
        (Failed, StopRequested) => Some(Disconnected),
        _ => None,
    }
}

/// Whether `state` is a "work in progress" state the UI should show as busy.
fn is_transitional_state(state: ConnectionState) -> bool {
    matches!(
        state,
        ConnectionState::Starting
            | ConnectionState::Connecting
            | ConnectionState::Disconnecting
            | ConnectionState::Stopping
    )
}

/// Per-instance connection record, owned exclusively by the coordinator.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// The instance this record describes.
    pub instance_id: InstanceId,
    /// Module (child process kind) identifier.
    pub module_id: String,
    /// Device identifier this instance is paired with.
    pub device_id: String,
    /// Current state.
    pub state: ConnectionState,
    /// When the current state was entered.
    pub state_entered_at: Instant,
    /// Error description, cleared on entry to `Running`/`Connected`.
    pub error_message: Option<String>,
    /// Attempts made by the most recent (or in-flight) `connect_device` call.
    pub retry_count: u32,
    /// Timestamp of the most recent heartbeat, if any.
    pub last_heartbeat_at: Option<Instant>,
}

impl ConnectionInfo {
    fn new(instance_id: InstanceId, module_id: String, device_id: String) -> Self {
        Self {
            instance_id,
            module_id,
            device_id,
            state: ConnectionState::Disconnected,
            state_entered_at: Instant::now(),
            error_message: None,
            retry_count: 0,
            last_heartbeat_at: None,
        }
    }

    /// Time elapsed since this instance entered its current state.
    pub fn time_in_state(&self) -> Duration {
        self.state_entered_at.elapsed()
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type StateObserver =
    Arc<dyn Fn(InstanceId, ConnectionState, ConnectionState, Option<String>) -> BoxFuture + Send + Sync>;
type UiCallback = Arc<dyn Fn(String, bool, bool) -> BoxFuture + Send + Sync>;

/// Centralized owner of every instance's connection state.
///
/// The sole writer of `ConnectionInfo.state`; every mutation happens inside
/// [`Self::transition`], which holds the internal mutex only across the
/// non-yielding read-modify-write, then notifies observers after releasing
/// it.
pub struct ConnectionCoordinator {
    connections: Mutex<HashMap<InstanceId, ConnectionInfo>>,
    command_tracker: Arc<CommandTracker>,
    heartbeat_monitor: Arc<HeartbeatMonitor>,
    config: CoordinatorConfig,
    state_observers: Mutex<Vec<(u64, StateObserver)>>,
    observer_ids: AtomicU64,
    ui_callback: Mutex<Option<UiCallback>>,
}

impl ConnectionCoordinator {
    /// Create a coordinator from configuration. Returned as an `Arc` since
    /// [`Self::start`] hands out weak references to the heartbeat monitor's
    /// callbacks to break the coordinator/monitor reference cycle.
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            command_tracker: CommandTracker::new(),
            heartbeat_monitor: HeartbeatMonitor::new(config.heartbeat.clone()),
            config,
            state_observers: Mutex::new(Vec::new()),
            observer_ids: AtomicU64::new(0),
            ui_callback: Mutex::new(None),
        })
    }

    /// Start the command tracker and, if enabled, the heartbeat monitor.
    pub async fn start(self: &Arc<Self>) {
        self.command_tracker.start().await;

        if self.config.heartbeat_enabled {
            let weak = Arc::downgrade(self);
            self.heartbeat_monitor
                .set_unhealthy_callback(move |instance_id, info| {
                    let weak = weak.clone();
                    async move {
                        if let Some(coordinator) = weak.upgrade() {
                            coordinator.handle_heartbeat_unhealthy(instance_id, info).await;
                        }
                    }
                })
                .await;

            let weak = Arc::downgrade(self);
            self.heartbeat_monitor
                .set_recovered_callback(move |instance_id, info| {
                    let weak = weak.clone();
                    async move {
                        if let Some(coordinator) = weak.upgrade() {
                            coordinator.handle_heartbeat_recovered(instance_id, info).await;
                        }
                    }
                })
                .await;

            self.heartbeat_monitor.start().await;
        }

        tracing::info!("connection coordinator started");
    }

    /// Stop the heartbeat monitor, then the command tracker, in that order
    /// (§5: "Stopping the Coordinator stops the Command Tracker and
    /// Heartbeat Monitor in that order").
    pub async fn stop(&self) {
        self.heartbeat_monitor.stop().await;
        self.command_tracker.stop().await;
        tracing::info!("connection coordinator stopped");
    }

    /// Start an instance: transition to `Starting`, invoke `start_fn`, then
    /// settle into `Running` or `Failed`.
    pub async fn start_instance<F, Fut>(
        &self,
        instance_id: InstanceId,
        module_id: impl Into<String>,
        device_id: impl Into<String>,
        start_fn: F,
    ) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        let module_id = module_id.into();
        let device_id = device_id.into();

        {
            let mut connections = self.connections.lock().await;
            connections.insert(
                instance_id.clone(),
                ConnectionInfo::new(instance_id.clone(), module_id, device_id),
            );
        }

        self.transition(&instance_id, ConnectionEvent::StartRequested).await;

        match start_fn().await {
            Ok(true) => {
                self.transition(&instance_id, ConnectionEvent::ProcessStarted).await;

                if self.config.heartbeat_enabled {
                    self.heartbeat_monitor.register(instance_id.clone());
                }

                self.transition(&instance_id, ConnectionEvent::ProcessReady).await;
                true
            }
            Ok(false) => {
                self.set_error(&instance_id, "failed to start process".to_string()).await;
                self.transition(&instance_id, ConnectionEvent::ProcessCrashed).await;
                false
            }
            Err(e) => {
                self.set_error(&instance_id, e.to_string()).await;
                self.transition(&instance_id, ConnectionEvent::ProcessCrashed).await;
                false
            }
        }
    }

    /// Connect a device, retrying transient failures via the Retry Engine.
    ///
    /// Requires the instance to currently be `Running` or `Failed`; a call
    /// while already `Connecting` is a no-op returning `false`.
    pub async fn connect_device<B, S, Fut>(
        &self,
        instance_id: &InstanceId,
        device_id: &str,
        mut build_cmd_fn: B,
        mut send_fn: S,
    ) -> bool
    where
        B: FnMut(&str) -> String,
        S: FnMut(String) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        match self.get_state(instance_id).await {
            ConnectionState::Running | ConnectionState::Failed => {}
            ConnectionState::Connecting => return false,
            other => {
                tracing::warn!(%instance_id, ?other, "connect_device called outside Running/Failed");
                return false;
            }
        }

        if !self.transition(instance_id, ConnectionEvent::ConnectRequested).await {
            return false;
        }

        let tracker = Arc::clone(&self.command_tracker);
        let command_timeout = self.config.command_timeout;
        let mut policy = RetryPolicy::from_config(&self.config.retry);

        let retry_result = policy
            .execute(|| {
                let command_id = tracker.generate_command_id();
                let payload = build_cmd_fn(&command_id);
                let send_fut = send_fn(payload);
                let tracker = Arc::clone(&tracker);
                let device_id = device_id.to_string();

                async move {
                    let outcome = tracker
                        .send_and_wait(command_id, "assign_device", Some(device_id), command_timeout, move || {
                            send_fut
                        })
                        .await;

                    if outcome.success {
                        Ok(true)
                    } else {
                        Err(outcome.error.unwrap_or_else(|| "assign_device failed".to_string()))
                    }
                }
            })
            .await;

        if retry_result.success {
            self.transition(instance_id, ConnectionEvent::DeviceReady).await;
            tracing::info!(
                %instance_id,
                attempts = retry_result.attempt_count(),
                duration = ?retry_result.total_duration,
                "device connected"
            );
            true
        } else {
            let error = retry_result
                .final_error
                .clone()
                .unwrap_or_else(|| "connection failed".to_string());
            self.set_retry_count(instance_id, retry_result.attempt_count() as u32).await;
            self.set_error(instance_id, error.clone()).await;
            self.transition(instance_id, ConnectionEvent::RetryExhausted).await;
            tracing::error!(
                %instance_id,
                attempts = retry_result.attempt_count(),
                %error,
                "device connection failed"
            );
            false
        }
    }

    /// Disconnect a device. Requires `Connected`; otherwise a no-op.
    ///
    /// Always settles back into `Running` regardless of whether the send
    /// succeeded — the instance side has already committed to releasing the
    /// device once asked.
    pub async fn disconnect_device<S, Fut>(
        &self,
        instance_id: &InstanceId,
        payload: String,
        send_fn: S,
        timeout: Duration,
    ) -> bool
    where
        S: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.get_state(instance_id).await != ConnectionState::Connected {
            tracing::warn!(%instance_id, "disconnect_device called while not Connected");
            return false;
        }

        self.transition(instance_id, ConnectionEvent::DisconnectRequested).await;

        match tokio::time::timeout(timeout, send_fn(payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(%instance_id, error = %e, "disconnect send failed"),
            Err(_) => tracing::warn!(%instance_id, "disconnect command timed out"),
        }

        self.transition(instance_id, ConnectionEvent::DeviceDisconnected).await;
        true
    }

    /// Stop an instance: unregister from heartbeat monitoring, invoke
    /// `stop_fn`, and settle into `Disconnected` regardless of its outcome —
    /// idempotence matters more than propagating `stop_fn` errors here.
    pub async fn stop_instance<F, Fut>(&self, instance_id: &InstanceId, stop_fn: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let exists = self.connections.lock().await.contains_key(instance_id);
        if !exists {
            return true;
        }

        if self.get_state(instance_id).await == ConnectionState::Disconnected {
            return true;
        }

        self.heartbeat_monitor.unregister(instance_id);

        self.transition(instance_id, ConnectionEvent::StopRequested).await;

        if let Err(e) = stop_fn().await {
            tracing::warn!(%instance_id, error = %e, "stop_fn failed");
        }

        self.transition(instance_id, ConnectionEvent::ProcessStopped).await;
        true
    }

    /// Handle a `device_ready` status message.
    ///
    /// Resolves a matching pending `assign_device` command first; if none
    /// matched and the instance is currently `Connecting`, treats it as
    /// spontaneous readiness and transitions directly (narrow reading of the
    /// Open Question in §9 — see `DESIGN.md`).
    pub async fn on_device_ready(
        &self,
        instance_id: &InstanceId,
        device_id: &str,
        data: Option<serde_json::Value>,
    ) {
        let resolved = self.command_tracker.on_device_ready(device_id, data).await;
        if !resolved && self.get_state(instance_id).await == ConnectionState::Connecting {
            self.transition(instance_id, ConnectionEvent::DeviceReady).await;
        }
    }

    /// Handle a `device_error` status message. Never synthesizes a
    /// transition — `Connecting -> Running` follows only from the Retry
    /// Engine's verdict.
    pub async fn on_device_error(
        &self,
        _instance_id: &InstanceId,
        device_id: &str,
        error: String,
        data: Option<serde_json::Value>,
    ) {
        self.command_tracker.on_device_error(device_id, error, data).await;
    }

    /// Handle a heartbeat status message.
    pub async fn on_heartbeat(&self, instance_id: &InstanceId, _data: Option<serde_json::Value>) {
        self.heartbeat_monitor.on_heartbeat(instance_id.clone()).await;

        let mut connections = self.connections.lock().await;
        if let Some(info) = connections.get_mut(instance_id) {
            info.last_heartbeat_at = Some(Instant::now());
        }
    }

    /// Handle process termination, signaled by the host's process-exit
    /// watcher.
    pub async fn on_process_exit(&self, instance_id: &InstanceId, crashed: bool) {
        self.heartbeat_monitor.unregister(instance_id);
        let event = if crashed {
            ConnectionEvent::ProcessCrashed
        } else {
            ConnectionEvent::ProcessStopped
        };
        self.transition(instance_id, event).await;
    }

    /// Current state of an instance; `Disconnected` if unknown.
    pub async fn get_state(&self, instance_id: &InstanceId) -> ConnectionState {
        self.connections
            .lock()
            .await
            .get(instance_id)
            .map(|i| i.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Full connection record for an instance, if it exists.
    pub async fn get_info(&self, instance_id: &InstanceId) -> Option<ConnectionInfo> {
        self.connections.lock().await.get(instance_id).cloned()
    }

    /// Current error message for an instance, if any.
    pub async fn get_error(&self, instance_id: &InstanceId) -> Option<String> {
        self.connections
            .lock()
            .await
            .get(instance_id)
            .and_then(|i| i.error_message.clone())
    }

    /// Whether an instance is currently `Connected`.
    pub async fn is_connected(&self, instance_id: &InstanceId) -> bool {
        self.get_state(instance_id).await == ConnectionState::Connected
    }

    /// Whether an instance is in a transitional (UI-should-show-busy) state.
    pub async fn is_transitional(&self, instance_id: &InstanceId) -> bool {
        is_transitional_state(self.get_state(instance_id).await)
    }

    /// Derived UI view for a device: `(connected, connecting)`.
    pub async fn get_ui_state(&self, device_id: &str) -> (bool, bool) {
        let connections = self.connections.lock().await;
        for info in connections.values() {
            if info.device_id == device_id {
                return (
                    info.state == ConnectionState::Connected,
                    is_transitional_state(info.state),
                );
            }
        }
        (false, false)
    }

    /// Register a state-change observer, returning a handle for
    /// [`Self::remove_state_observer`].
    pub async fn add_state_observer<F, Fut>(&self, callback: F) -> u64
    where
        F: Fn(InstanceId, ConnectionState, ConnectionState, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.observer_ids.fetch_add(1, Ordering::SeqCst);
        let boxed: StateObserver = Arc::new(move |a, b, c, d| Box::pin(callback(a, b, c, d)));
        self.state_observers.lock().await.push((id, boxed));
        id
    }

    /// Remove a previously registered observer.
    pub async fn remove_state_observer(&self, handle: u64) {
        self.state_observers.lock().await.retain(|(id, _)| *id != handle);
    }

    /// Set the callback invoked whenever a device's derived UI state
    /// changes.
    pub async fn set_ui_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(String, bool, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.ui_callback.lock().await = Some(Arc::new(move |a, b, c| Box::pin(callback(a, b, c))));
    }

    /// Adapter form of [`Self::start_instance`] for hosts that bundle their
    /// callbacks behind a single [`ChildController`] instead of passing
    /// `start_fn` directly.
    pub async fn start_instance_with_controller(
        &self,
        instance_id: InstanceId,
        module_id: impl Into<String>,
        device_id: impl Into<String>,
        controller: Arc<dyn ChildController>,
    ) -> bool {
        self.start_instance(instance_id, module_id, device_id, move || async move {
            controller.start().await.map(|()| true)
        })
        .await
    }

    /// Adapter form of [`Self::connect_device`] driven by a [`ChildController`].
    pub async fn connect_device_with_controller(
        &self,
        instance_id: &InstanceId,
        device_id: &str,
        controller: Arc<dyn ChildController>,
    ) -> bool {
        let build_controller = Arc::clone(&controller);
        let send_controller = Arc::clone(&controller);
        self.connect_device(
            instance_id,
            device_id,
            move |command_id| build_controller.build_command(command_id),
            move |payload| {
                let controller = Arc::clone(&send_controller);
                async move { controller.send(payload).await }
            },
        )
        .await
    }

    /// Adapter form of [`Self::stop_instance`] driven by a [`ChildController`].
    pub async fn stop_instance_with_controller(
        &self,
        instance_id: &InstanceId,
        controller: Arc<dyn ChildController>,
    ) -> bool {
        self.stop_instance(instance_id, move || async move { controller.stop().await })
            .await
    }

    async fn handle_heartbeat_unhealthy(&self, instance_id: InstanceId, _info: HeartbeatInfo) {
        tracing::warn!(%instance_id, "instance unhealthy: heartbeat timeout");
        self.set_error(&instance_id, "heartbeat timeout: instance unresponsive".to_string())
            .await;
        self.transition(&instance_id, ConnectionEvent::HeartbeatTimeout).await;
    }

    async fn handle_heartbeat_recovered(&self, instance_id: InstanceId, _info: HeartbeatInfo) {
        tracing::info!(%instance_id, "instance recovered: heartbeat resumed");
        // Recovery clears the error but does not itself move connection
        // state — a heartbeat timeout already moved the instance to
        // `Failed`, and only `StartRequested` brings it back.
        self.clear_error(&instance_id).await;
    }

    async fn set_error(&self, instance_id: &InstanceId, error: String) {
        if let Some(info) = self.connections.lock().await.get_mut(instance_id) {
            info.error_message = Some(error);
        }
    }

    async fn clear_error(&self, instance_id: &InstanceId) {
        if let Some(info) = self.connections.lock().await.get_mut(instance_id) {
            info.error_message = None;
        }
    }

    async fn set_retry_count(&self, instance_id: &InstanceId, count: u32) {
        if let Some(info) = self.connections.lock().await.get_mut(instance_id) {
            info.retry_count = count;
        }
    }

    /// Attempt `(current_state, event) -> new_state`. Invalid pairs are
    /// logged at `WARN` and rejected as a no-op, per invariant 3.
    async fn transition(&self, instance_id: &InstanceId, event: ConnectionEvent) -> bool {
        let (old_state, new_state, error) = {
            let mut connections = self.connections.lock().await;
            let Some(info) = connections.get_mut(instance_id) else {
                tracing::warn!(%instance_id, ?event, "transition for unknown instance");
                return false;
            };

            let old_state = info.state;
            let Some(new_state) = allowed_transition(old_state, event) else {
                tracing::warn!(%instance_id, ?old_state, ?event, "rejected invalid transition");
                return false;
            };

            info.state = new_state;
            info.state_entered_at = Instant::now();

            if matches!(new_state, ConnectionState::Running | ConnectionState::Connected) {
                info.error_message = None;
                info.retry_count = 0;
            }

            tracing::info!(%instance_id, ?old_state, ?new_state, ?event, "state transition");
            (old_state, new_state, info.error_message.clone())
        };

        self.notify_state_change(instance_id, old_state, new_state, error).await;
        true
    }

    /// Notify observers and the UI callback. Runs after the state mutex has
    /// been released so observers may re-enter public API without
    /// deadlocking.
    async fn notify_state_change(
        &self,
        instance_id: &InstanceId,
        old_state: ConnectionState,
        new_state: ConnectionState,
        error: Option<String>,
    ) {
        let observers = self.state_observers.lock().await.clone();
        for (_, observer) in observers {
            let fut = observer(instance_id.clone(), old_state, new_state, error.clone());
            if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                tracing::error!(%instance_id, "state observer panicked");
            }
        }

        self.update_ui(instance_id).await;
    }

    async fn update_ui(&self, instance_id: &InstanceId) {
        let Some(callback) = self.ui_callback.lock().await.clone() else {
            return;
        };

        let device_id = {
            let connections = self.connections.lock().await;
            connections.get(instance_id).map(|i| i.device_id.clone())
        };
        let Some(device_id) = device_id else {
            return;
        };

        let (connected, connecting) = self.get_ui_state(&device_id).await;

        let fut = callback(device_id, connected, connecting);
        if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            tracing::error!("UI callback panicked");
        }
    }
}
