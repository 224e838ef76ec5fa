//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Top-level configuration for a connection coordinator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Timeout for a single correlated command round-trip.
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Whether the heartbeat monitor is active for new instances.
    pub heartbeat_enabled: bool,

    /// Heartbeat monitor tuning.
    pub heartbeat: HeartbeatConfig,

    /// Retry engine tuning for device connect attempts.
    pub retry: RetryConfig,

    /// Shutdown orchestrator phase timeouts.
    pub shutdown: ShutdownTimeouts,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            heartbeat_enabled: true,
            heartbeat: HeartbeatConfig::default(),
            retry: RetryConfig::default(),
            shutdown: ShutdownTimeouts::default(),
        }
    }
}

/// Heartbeat monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Expected interval between heartbeats from a healthy instance.
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// Time without a heartbeat before an instance is considered unhealthy.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Missed heartbeats before WARNING status.
    pub warning_threshold: u32,

    /// Missed heartbeats before UNHEALTHY status.
    pub unhealthy_threshold: u32,

    /// Timeout applied to a single unhealthy/recovered callback invocation.
    #[serde(with = "duration_secs")]
    pub callback_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
            warning_threshold: 2,
            unhealthy_threshold: 3,
            callback_timeout: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff configuration for the retry engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Initial delay before the second attempt.
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,

    /// Ceiling on the computed delay.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay for each successive attempt.
    pub backoff_factor: f64,

    /// Jitter fraction applied symmetrically around the computed delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

/// Shutdown orchestrator phase timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownTimeouts {
    /// Time to wait for a device-unassign acknowledgment.
    #[serde(with = "duration_secs")]
    pub unassign_ack: Duration,

    /// Time to wait for the process to exit after a polite quit command.
    #[serde(with = "duration_secs")]
    pub quit: Duration,

    /// Time to wait for the process to exit after SIGTERM.
    #[serde(with = "duration_secs")]
    pub terminate: Duration,

    /// Time budget for draining stdout/stderr after the process has exited.
    #[serde(with = "duration_secs")]
    pub drain: Duration,
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self {
            unassign_ack: Duration::from_secs(3),
            quit: Duration::from_secs(7),
            terminate: Duration::from_secs(2),
            drain: Duration::from_secs(1),
        }
    }
}
