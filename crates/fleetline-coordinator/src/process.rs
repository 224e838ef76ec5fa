//! [`fleetline_core::traits::ManagedProcess`] implementation backed by
//! [`tokio::process::Child`].

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Child;

use fleetline_core::traits::ManagedProcess;

/// Wraps a spawned OS process so the shutdown orchestrator can drive it
/// through `tokio::process::Child` without depending on it directly.
pub struct TokioProcess {
    child: Child,
}

impl TokioProcess {
    /// Wrap an already-spawned child process.
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl ManagedProcess for TokioProcess {
    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.and_then(|status| status.code()))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }

    fn stdout(&mut self) -> Option<&mut (dyn AsyncRead + Send + Unpin)> {
        self.child
            .stdout
            .as_mut()
            .map(|s| s as &mut (dyn AsyncRead + Send + Unpin))
    }

    fn stderr(&mut self) -> Option<&mut (dyn AsyncRead + Send + Unpin)> {
        self.child
            .stderr
            .as_mut()
            .map(|s| s as &mut (dyn AsyncRead + Send + Unpin))
    }
}
