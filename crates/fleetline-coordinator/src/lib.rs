//! fleetline-coordinator: connection coordination for a fleet of supervised
//! child worker processes.
//!
//! Owns the per-instance connection state machine and drives the Retry
//! Engine, Command Tracker, Heartbeat Monitor, and Shutdown Orchestrator on
//! its behalf. The Reconnecting Read-Loop is a separate, passive pattern for
//! device read loops and is not used by the coordinator itself.

pub mod command_tracker;
pub mod coordinator;
pub mod heartbeat;
pub mod process;
pub mod reconnect;
pub mod retry;
pub mod shutdown;

pub use command_tracker::{CommandResult, CommandTracker};
pub use coordinator::{ConnectionCoordinator, ConnectionEvent, ConnectionInfo, ConnectionState};
pub use heartbeat::{HealthStatus, HeartbeatInfo, HeartbeatMonitor};
pub use process::TokioProcess;
pub use reconnect::{ReconnectConfig, ReconnectState, ReconnectTracker, ReconnectingReadLoop};
pub use retry::{RetryAttempt, RetryOutcome, RetryPolicy, RetryResult};
pub use shutdown::{ShutdownOrchestrator, ShutdownPhase, ShutdownResult};
