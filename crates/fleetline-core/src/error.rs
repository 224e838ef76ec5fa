//! Error taxonomy for the fleet connection coordinator

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the fleet coordinator
#[derive(Error, Debug)]
pub enum FleetError {
    /// Command delivery error
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Retry engine error
    #[error("retry error: {0}")]
    Retry(#[from] RetryError),

    /// Shutdown orchestration error
    #[error("shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while sending a correlated command and awaiting its result
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// No acknowledgment arrived before the command's timeout elapsed
    #[error("command timed out")]
    TimedOut,

    /// The child reported failure for this command
    #[error("command failed: {0}")]
    Failed(String),

    /// The tracker was stopped while this command was still pending
    #[error("command tracker stopped")]
    TrackerStopped,
}

/// Errors raised by the retry engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError {
    /// All configured attempts were exhausted without success
    #[error("retry attempts exhausted: {0}")]
    Exhausted(String),

    /// The retry loop was aborted before exhausting its attempts
    #[error("retry aborted")]
    Aborted,
}

/// Errors raised by the shutdown orchestrator
///
/// These are captured in a `ShutdownResult` rather than propagated; the
/// variant exists so phase failures have a typed representation internally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShutdownError {
    /// The child process could not be waited on or signaled
    #[error("process control failed: {0}")]
    ProcessControl(String),

    /// An uncaught failure occurred during a shutdown phase
    #[error("shutdown failed in phase {phase}: {message}")]
    PhaseFailed {
        /// The phase in progress when the failure occurred
        phase: String,
        /// Description of the failure
        message: String,
    },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
