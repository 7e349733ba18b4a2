//! FUSE mount orchestration.
//!
//! The mounter performs the privileged half of a mount: it opens
//! `/dev/fuse`, performs the kernel mount with the descriptor bound via
//! `fd=<n>`, and publishes the descriptor through the socket registry to
//! whichever consumer connects. The publish runs as its own task so the
//! triggering RPC returns immediately; the task is joinable through the
//! registry entry it tears down on exit.

use async_trait::async_trait;
use fusepass_core::{Error, MountPayload, Result, SocketRegistry, relay};
use nix::mount::{MntFlags, MsFlags};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One parsed line of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub device: String,
    pub path: PathBuf,
    pub fstype: String,
}

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mounts `volume_id` at `target` and publishes the FUSE descriptor
    /// through a listener at `socket_path`. Returns once the publish task
    /// is running; its outcome is observable only through logs and through
    /// the target becoming (or never becoming) a served mount.
    async fn mount(
        &self,
        volume_id: &str,
        target: &Path,
        socket_path: &Path,
        options: &[String],
    ) -> Result<()>;

    async fn unmount(&self, target: &Path) -> Result<()>;

    fn list(&self) -> Result<Vec<MountPoint>>;

    fn is_mount_point(&self, target: &Path) -> Result<bool> {
        let target = target.to_path_buf();
        Ok(self.list()?.iter().any(|m| m.path == target))
    }
}

/// Force-unmount capability, for recovering a mountpoint whose FUSE server
/// never started or already died (a plain unmount would hang on it).
/// Implemented by exactly one concrete mounter; callers pick it by type at
/// construction time.
#[async_trait]
pub trait ForceUnmounter: Mounter {
    async fn unmount_force(&self, target: &Path, timeout: Duration) -> Result<()>;
}

/// The production mounter.
pub struct FuseMounter {
    registry: Arc<SocketRegistry>,
}

impl FuseMounter {
    pub fn new(registry: Arc<SocketRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Mounter for FuseMounter {
    async fn mount(
        &self,
        volume_id: &str,
        target: &Path,
        socket_path: &Path,
        options: &[String],
    ) -> Result<()> {
        let (mount_options, sidecar_options) = prepare_mount_options(options);
        if !sidecar_options.is_empty() {
            debug!(
                options = ?sidecar_options,
                "options not applied by the privileged mount"
            );
        }

        let payload = serde_json::to_vec(&MountPayload {
            volume_name: volume_id.to_string(),
        })
        .map_err(|e| Error::Protocol(format!("failed to encode mount payload: {e}")))?;

        // Synchronous, so a duplicate registration surfaces to the caller
        // before anything touched the filesystem.
        self.registry.register(target, socket_path)?;

        let registry = Arc::clone(&self.registry);
        let volume_id = volume_id.to_string();
        let target = target.to_path_buf();
        tokio::spawn(async move {
            if let Err(e) =
                publish_descriptor(&registry, &volume_id, &target, &mount_options, payload).await
            {
                error!(
                    target = %target.display(),
                    volume = %volume_id,
                    error = %e,
                    "descriptor publish failed"
                );
            }
            // A failed attempt must be indistinguishable from a completed
            // one as far as the registry is concerned.
            if let Err(e) = registry.close_and_unregister(&target, false) {
                error!(
                    target = %target.display(),
                    error = %e,
                    "failed to unregister fd-passing socket"
                );
            }
        });

        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let path = target.to_path_buf();
        run_blocking(move || nix::mount::umount2(&path, MntFlags::empty()))
            .await?
            .map_err(|e| {
                Error::PrivilegedOp(format!("failed to unmount {}: {e}", target.display()))
            })
    }

    fn list(&self) -> Result<Vec<MountPoint>> {
        let contents = std::fs::read_to_string("/proc/mounts")?;
        Ok(parse_proc_mounts(&contents))
    }
}

#[async_trait]
impl ForceUnmounter for FuseMounter {
    async fn unmount_force(&self, target: &Path, timeout: Duration) -> Result<()> {
        // Graceful first. A mount whose server is gone hangs here, so fall
        // back to MNT_FORCE once the deadline passes.
        let path = target.to_path_buf();
        let graceful = tokio::time::timeout(
            timeout,
            run_blocking(move || nix::mount::umount2(&path, MntFlags::empty())),
        )
        .await;

        match graceful {
            Ok(Ok(Ok(()))) => return Ok(()),
            Ok(Ok(Err(e))) => {
                debug!(target = %target.display(), error = %e, "graceful unmount failed, forcing")
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(target = %target.display(), "graceful unmount timed out, forcing")
            }
        }

        let path = target.to_path_buf();
        run_blocking(move || nix::mount::umount2(&path, MntFlags::MNT_FORCE))
            .await?
            .map_err(|e| {
                Error::PrivilegedOp(format!("failed to force unmount {}: {e}", target.display()))
            })
    }
}

async fn publish_descriptor(
    registry: &SocketRegistry,
    volume_id: &str,
    target: &Path,
    options: &[String],
    payload: Vec<u8>,
) -> Result<()> {
    let volume = volume_id.to_string();
    let mount_target = target.to_path_buf();
    let mount_options = options.to_vec();
    let fuse_fd =
        run_blocking(move || mount_with_fuse_device(&volume, &mount_target, &mount_options))
            .await??;
    info!(target = %target.display(), volume = %volume_id, "fuse filesystem mounted");

    debug!(target = %target.display(), "waiting for the descriptor consumer");
    let conn = registry.accept(target).await?;
    let conn = conn.into_std().map_err(Error::Transport)?;
    conn.set_nonblocking(false).map_err(Error::Transport)?;

    let sent = run_blocking(move || {
        let result = relay::send_message(&conn, fuse_fd.as_fd(), &payload);
        // The kernel mount holds its own reference; the local copy is
        // closed here whether or not the send went through.
        drop(fuse_fd);
        result
    })
    .await?;
    sent?;

    info!(target = %target.display(), volume = %volume_id, "descriptor published");
    Ok(())
}

/// Opens `/dev/fuse` and performs the privileged mount with the descriptor
/// bound via the `fd=` data option. On failure the descriptor is released
/// and no mount exists.
fn mount_with_fuse_device(volume_id: &str, target: &Path, options: &[String]) -> Result<OwnedFd> {
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/fuse")
        .map_err(|e| Error::PrivilegedOp(format!("failed to open /dev/fuse: {e}")))?;
    let fuse_fd = OwnedFd::from(device);

    let (flags, mut data) = split_mount_options(options);
    data.push(format!("fd={}", fuse_fd.as_raw_fd()));
    let data = data.join(",");

    nix::mount::mount(
        Some(volume_id),
        target,
        Some("fuse"),
        flags,
        Some(data.as_str()),
    )
    .map_err(|e| {
        Error::PrivilegedOp(format!(
            "failed to mount fuse filesystem at {}: {e}",
            target.display()
        ))
    })?;

    Ok(fuse_fd)
}

const ALLOWED_ESCAPED_OPTIONS: &[&str] = &[
    "exec", "noexec", "atime", "noatime", "sync", "async", "dirsync",
];
const PASSTHROUGH_OPTIONS: &[&str] = &["rw", "ro"];

/// Builds the deterministic option set for the privileged mount: fixed
/// safety options, `rw`/`ro` pass-through, and a generic `o=<opt>` escape
/// admitted only against the allow-list (anything else is dropped with a
/// warning, never granted). Duplicates collapse and the result is stably
/// sorted. The second list holds the options left over for the sidecar.
pub fn prepare_mount_options(options: &[String]) -> (Vec<String>, Vec<String>) {
    let mut mount_options: BTreeSet<String> = [
        "nodev",
        "nosuid",
        "allow_other",
        "default_permissions",
        "rootmode=40000",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    mount_options.insert(format!("user_id={}", nix::unistd::getuid().as_raw()));
    mount_options.insert(format!("group_id={}", nix::unistd::getgid().as_raw()));

    let mut remaining: BTreeSet<String> = options
        .iter()
        .filter(|o| !o.is_empty())
        .cloned()
        .collect();

    for option in PASSTHROUGH_OPTIONS {
        if remaining.remove(*option) {
            mount_options.insert((*option).to_string());
        }
    }

    let escaped: Vec<String> = remaining
        .iter()
        .filter(|o| o.starts_with("o="))
        .cloned()
        .collect();
    for option in escaped {
        remaining.remove(&option);
        let value = &option[2..];
        if ALLOWED_ESCAPED_OPTIONS.contains(&value) {
            mount_options.insert(value.to_string());
        } else {
            warn!(
                option = value,
                "discarding mount option not on the allow-list"
            );
        }
    }

    (
        mount_options.into_iter().collect(),
        remaining.into_iter().collect(),
    )
}

/// Splits prepared options into mount(2) flags and the comma-joined data
/// string entries. Options naming the default state (`rw`, `exec`, ...)
/// map to no flag at all.
fn split_mount_options(options: &[String]) -> (MsFlags, Vec<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "nodev" => flags |= MsFlags::MS_NODEV,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "rw" | "exec" | "atime" | "async" => {}
            _ => data.push(option.clone()),
        }
    }
    (flags, data)
}

fn parse_proc_mounts(contents: &str) -> Vec<MountPoint> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            let fstype = fields.next()?;
            Some(MountPoint {
                device: unescape_mount_field(device),
                path: PathBuf::from(unescape_mount_field(path)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// `/proc/mounts` escapes space, tab, newline and backslash as three-digit
/// octal sequences.
fn unescape_mount_field(field: &str) -> String {
    let chars: Vec<char> = field.chars().collect();
    let mut out = String::with_capacity(field.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && i + 3 < chars.len() {
            let octal: String = chars[i + 1..i + 4].iter().collect();
            if let Ok(value) = u8::from_str_radix(&octal, 8) {
                out.push(value as char);
                i += 4;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))
}
