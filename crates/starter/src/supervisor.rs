//! Supervision of the spawned FUSE process.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::process::ExitStatus;
use tokio::process::Child;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// The FUSE process owned by the starter.
///
/// The starter's lifetime is tied to the child's: a termination request is
/// forwarded to the child, and the starter only exits once the child's
/// exit status has been observed, so the child is never orphaned and the
/// mount's release is never missed.
pub struct SupervisedChild {
    child: Child,
    volume_name: String,
}

impl SupervisedChild {
    pub(crate) fn new(child: Child, volume_name: String) -> Self {
        Self { child, volume_name }
    }

    /// Forwards SIGTERM to the child if it is still running.
    pub fn terminate(&self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(
                volume = %self.volume_name,
                error = %e,
                "failed to forward SIGTERM to the fuse process"
            );
        }
    }

    /// Runs the child to completion, forwarding the first SIGTERM the
    /// starter receives. Returns the child's exit status exactly once.
    pub async fn supervise(mut self) -> std::io::Result<ExitStatus> {
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            status = self.child.wait() => {
                // The fuse process exited on its own; nothing to forward.
                let status = status?;
                info!(volume = %self.volume_name, %status, "fuse process exited");
                return Ok(status);
            }
            _ = sigterm.recv() => {
                info!(
                    volume = %self.volume_name,
                    "received SIGTERM, forwarding to the fuse process"
                );
            }
        }

        self.terminate();
        let status = self.child.wait().await?;
        info!(volume = %self.volume_name, %status, "fuse process exited");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn spawn_sleeper() -> SupervisedChild {
        let child = tokio::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        SupervisedChild::new(child, "vol-test".to_string())
    }

    #[tokio::test]
    async fn terminate_forwards_sigterm() {
        let child = spawn_sleeper();
        child.terminate();
        let status = child.supervise().await.unwrap();
        assert!(!status.success());
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn supervise_reports_natural_exit() {
        let child = tokio::process::Command::new("/bin/true").spawn().unwrap();
        let supervised = SupervisedChild::new(child, "vol-test".to_string());
        let status = supervised.supervise().await.unwrap();
        assert!(status.success());
    }
}
