//! Process and host-callback abstractions.

use async_trait::async_trait;
use tokio::io::AsyncRead;

/// Abstraction over a supervised child process.
///
/// The shutdown orchestrator is generic over this trait rather than
/// hard-wired to [`tokio::process::Child`], so it can be driven by a fake
/// process in tests.
#[async_trait]
pub trait ManagedProcess: Send {
    /// Wait for the process to exit, returning its exit code if available.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Non-blocking check for whether the process has already exited.
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Send a polite termination request (SIGTERM on Unix).
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Forcibly kill the process (SIGKILL on Unix).
    async fn kill(&mut self) -> std::io::Result<()>;

    /// Take ownership of the process's stdout pipe, if captured.
    fn stdout(&mut self) -> Option<&mut (dyn AsyncRead + Send + Unpin)>;

    /// Take ownership of the process's stderr pipe, if captured.
    fn stderr(&mut self) -> Option<&mut (dyn AsyncRead + Send + Unpin)>;
}

/// Bundles the host callbacks a connection coordinator needs to drive a
/// single instance's lifecycle, for hosts that prefer passing one object
/// instead of four closures per call.
///
/// The coordinator's own public methods do not require this trait — each
/// operation accepts its callback(s) directly as a generic parameter — but
/// accepts anything implementing it via a small adapter.
#[async_trait]
pub trait ChildController: Send + Sync {
    /// Spawn the child process for an instance.
    async fn start(&self) -> anyhow::Result<()>;

    /// Request the child process to stop.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Build the JSON payload for a command, given its correlation id.
    fn build_command(&self, command_id: &str) -> String;

    /// Send a raw payload to the child process.
    async fn send(&self, payload: String) -> anyhow::Result<()>;
}
