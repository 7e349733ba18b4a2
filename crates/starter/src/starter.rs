//! Launching the FUSE implementation with the received descriptor.

use crate::supervisor::SupervisedChild;
use fusepass_core::MountConfig;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::dup2;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::info;

/// Descriptor slot the FUSE implementation finds its `/dev/fuse` handle
/// in; referred to as `/dev/fd/3` by convention.
pub const FUSE_FD_SLOT: RawFd = 3;

/// Builds and spawns the configured FUSE implementation.
pub struct FuseStarter {
    program: PathBuf,
    args: Vec<String>,
}

impl FuseStarter {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Spawns the FUSE implementation with the received descriptor
    /// installed as inherited fd 3 and stdio passed through.
    ///
    /// The starter's own copy of the descriptor is closed before this
    /// returns: once the child holds it, a duplicate here would keep the
    /// kernel from noticing the child's exit releasing the mount.
    pub fn start(&self, config: MountConfig) -> std::io::Result<SupervisedChild> {
        info!(
            volume = %config.volume_name,
            program = %self.program.display(),
            args = ?self.args,
            "starting fuse implementation"
        );

        let raw = config.fuse_fd.as_raw_fd();
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);
        unsafe {
            command.pre_exec(move || {
                // Install the descriptor in the slot the child expects and
                // make sure it survives the exec.
                if raw == FUSE_FD_SLOT {
                    fcntl(raw, FcntlArg::F_SETFD(FdFlag::empty())).map_err(errno_to_io)?;
                } else {
                    dup2(raw, FUSE_FD_SLOT).map_err(errno_to_io)?;
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        drop(config.fuse_fd);

        Ok(SupervisedChild::new(child, config.volume_name))
    }
}

fn errno_to_io(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::fd::OwnedFd;

    fn config_with_file_fd(file: std::fs::File) -> MountConfig {
        MountConfig {
            fuse_fd: OwnedFd::from(file),
            volume_name: "vol-test".to_string(),
        }
    }

    #[tokio::test]
    async fn child_sees_the_descriptor_at_slot_three() {
        let mut backing = tempfile::tempfile().unwrap();
        let starter = FuseStarter::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), "echo handed-over >&3".to_string()],
        );

        let child = starter
            .start(config_with_file_fd(backing.try_clone().unwrap()))
            .unwrap();
        let status = child.supervise().await.unwrap();
        assert!(status.success());

        backing.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        backing.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "handed-over\n");
    }

    #[tokio::test]
    async fn child_exit_code_is_reported() {
        let backing = tempfile::tempfile().unwrap();
        let starter = FuseStarter::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), "exit 7".to_string()],
        );

        let child = starter.start(config_with_file_fd(backing)).unwrap();
        let status = child.supervise().await.unwrap();
        assert_eq!(status.code(), Some(7));
    }
}
