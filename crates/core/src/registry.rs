//! Per-target registry of fd-passing listener sockets.
//!
//! The privileged driver creates one listening socket per mount target and
//! hands the `/dev/fuse` descriptor to the single peer that connects. The
//! registry owns the lifecycle of those listeners:
//!
//! `unregistered -> registered -> accepted -> closed(+unlinked) -> unregistered`
//!
//! Entries are removed only by explicit unregistration, so a caller that
//! must not proceed until the publish task has released the descriptor can
//! block on [`SocketRegistry::wait_for_exit`].

use crate::error::{Error, Result};
use nix::unistd::{Gid, Uid, chown};
use std::collections::HashMap;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

/// Longest socket path bindable without relocating the working directory
/// (`sun_path` is 108 bytes on Linux, including the terminating NUL).
const SUN_PATH_MAX: usize = 107;

/// The sidecar runs as the unprivileged `nobody` user; see the distroless
/// nonroot convention.
const NOBODY_UID: u32 = 65534;
const NOBODY_GID: u32 = 65534;

struct Entry {
    socket_path: PathBuf,
    listener: Arc<UnixListener>,
    closed: bool,
    close_signal: Arc<Notify>,
    exit_tx: Option<oneshot::Sender<()>>,
    exit_rx: Option<oneshot::Receiver<()>>,
}

/// Concurrency-safe table of fd-passing sockets, keyed by mount target.
#[derive(Default)]
pub struct SocketRegistry {
    entries: Mutex<HashMap<PathBuf, Entry>>,
    // Binding a long socket path changes the process working directory;
    // that step must not interleave with another registration.
    chdir_lock: Mutex<()>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a listening socket at `socket_path` and registers it under
    /// `target`.
    ///
    /// One mount attempt per target at a time: a second registration for a
    /// target with a live entry fails with [`Error::AlreadyRegistered`]
    /// and leaves the existing entry untouched.
    pub fn register(&self, target: &Path, socket_path: &Path) -> Result<()> {
        if self.exists(target) {
            return Err(Error::AlreadyRegistered(target.to_path_buf()));
        }

        let listener = self.bind_listener(socket_path)?;
        adjust_socket_ownership(socket_path);
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        let (exit_tx, exit_rx) = oneshot::channel();
        let entry = Entry {
            socket_path: socket_path.to_path_buf(),
            listener: Arc::new(listener),
            closed: false,
            close_signal: Arc::new(Notify::new()),
            exit_tx: Some(exit_tx),
            exit_rx: Some(exit_rx),
        };

        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(target) {
            // Lost a race with a concurrent registration; release the
            // listener we just bound along with its socket file.
            drop(entry);
            let _ = std::fs::remove_file(socket_path);
            return Err(Error::AlreadyRegistered(target.to_path_buf()));
        }
        entries.insert(target.to_path_buf(), entry);
        debug!(
            target = %target.display(),
            socket = %socket_path.display(),
            "registered fd-passing socket"
        );
        Ok(())
    }

    /// Blocks until exactly one peer connects to the listener registered
    /// for `target`.
    ///
    /// Closing the entry (see [`Self::close_and_unregister`]) unblocks a
    /// pending accept with [`Error::ListenerClosed`].
    pub async fn accept(&self, target: &Path) -> Result<UnixStream> {
        let (listener, close_signal) = {
            let entries = self.entries.lock().unwrap();
            let entry = entries
                .get(target)
                .ok_or_else(|| Error::NotRegistered(target.to_path_buf()))?;
            if entry.closed {
                return Err(Error::ListenerClosed(target.to_path_buf()));
            }
            (Arc::clone(&entry.listener), Arc::clone(&entry.close_signal))
        };

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted.map_err(Error::Transport)?;
                debug!(target = %target.display(), "fd-passing socket accepted a peer");
                Ok(stream)
            }
            _ = close_signal.notified() => Err(Error::ListenerClosed(target.to_path_buf())),
        }
    }

    /// Whether `target` currently has a registered entry.
    pub fn exists(&self, target: &Path) -> bool {
        self.entries.lock().unwrap().contains_key(target)
    }

    /// Closes the listener for `target` and, unless `close_only` is set,
    /// removes the on-disk socket file, signals any waiter blocked in
    /// [`Self::wait_for_exit`] and drops the registry entry.
    ///
    /// Idempotent: closing an already-closed listener is a no-op, and an
    /// unknown target is treated as already unregistered.
    pub fn close_and_unregister(&self, target: &Path, close_only: bool) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(target) else {
            return Ok(());
        };

        if !entry.closed {
            entry.closed = true;
            entry.close_signal.notify_one();
        }

        if close_only {
            return Ok(());
        }

        let entry = entries.remove(target).expect("entry was just observed");
        match std::fs::remove_file(&entry.socket_path) {
            Ok(()) => {}
            // The consumer unlinks the socket once it has the descriptor.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                socket = %entry.socket_path.display(),
                error = %e,
                "failed to remove fd-passing socket file"
            ),
        }
        if let Some(tx) = entry.exit_tx {
            let _ = tx.send(());
        }
        debug!(target = %target.display(), "unregistered fd-passing socket");
        Ok(())
    }

    /// Blocks until the entry for `target` has been fully torn down
    /// (`close_and_unregister` with `close_only == false`).
    ///
    /// The completion signal admits one waiter; later calls, and calls for
    /// unknown targets, return immediately.
    pub async fn wait_for_exit(&self, target: &Path) {
        let rx = {
            let mut entries = self.entries.lock().unwrap();
            entries.get_mut(target).and_then(|entry| entry.exit_rx.take())
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    fn bind_listener(&self, socket_path: &Path) -> Result<StdUnixListener> {
        if socket_path.as_os_str().len() <= SUN_PATH_MAX {
            return Ok(StdUnixListener::bind(socket_path)?);
        }

        // The absolute path does not fit in sun_path: kubelet pod-volume
        // paths easily exceed it. Bind by file name from inside the parent
        // directory and restore the working directory right after.
        let dir = socket_path.parent().ok_or_else(|| {
            Error::InvalidArgument(format!("socket path {socket_path:?} has no parent directory"))
        })?;
        let name = socket_path.file_name().ok_or_else(|| {
            Error::InvalidArgument(format!("socket path {socket_path:?} has no file name"))
        })?;

        let _guard = self.chdir_lock.lock().unwrap();
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        let bound = StdUnixListener::bind(name);
        let restored = std::env::set_current_dir(&previous);
        let listener = bound?;
        restored?;
        Ok(listener)
    }
}

/// Hands the socket (and its directory) to the unprivileged sidecar user.
/// Only the root-running production driver can chown; elsewhere the socket
/// is left as-is.
fn adjust_socket_ownership(socket_path: &Path) {
    if !Uid::effective().is_root() {
        debug!(
            socket = %socket_path.display(),
            "not running as root, leaving socket ownership unchanged"
        );
        return;
    }

    let uid = Some(Uid::from_raw(NOBODY_UID));
    let gid = Some(Gid::from_raw(NOBODY_GID));
    if let Some(dir) = socket_path.parent() {
        if let Err(e) = chown(dir, uid, gid) {
            warn!(dir = %dir.display(), error = %e, "failed to change socket directory ownership");
        }
    }
    if let Err(e) = chown(socket_path, uid, gid) {
        warn!(socket = %socket_path.display(), error = %e, "failed to change socket ownership");
    }
}
