//! The mount handoff record received by descriptor consumers.

use crate::error::{Error, Result};
use crate::relay;
use serde::{Deserialize, Serialize};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use tracing::{info, warn};

/// Wire record accompanying the descriptor through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountPayload {
    pub volume_name: String,
}

/// The product of one relay exchange: the received `/dev/fuse` descriptor
/// plus the decoded payload. Lives only for the duration of one handoff.
#[derive(Debug)]
pub struct MountConfig {
    pub fuse_fd: OwnedFd,
    pub volume_name: String,
}

/// Connects to the fd-passing socket at `socket_path`, performs one relay
/// receive and decodes the payload.
///
/// Whatever the outcome, the connection is closed and the socket file is
/// unlinked afterwards; a socket already removed by the peer is fine.
pub fn prepare_mount_config(socket_path: &Path) -> Result<MountConfig> {
    info!(socket = %socket_path.display(), "connecting to fd-passing socket");
    let conn = UnixStream::connect(socket_path).map_err(Error::Transport)?;
    let received = receive_config(&conn);
    drop(conn);

    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            socket = %socket_path.display(),
            error = %e,
            "failed to remove fd-passing socket file"
        ),
    }

    received
}

fn receive_config(conn: &UnixStream) -> Result<MountConfig> {
    let (fuse_fd, payload) = relay::recv_message(conn)?;
    let payload: MountPayload = serde_json::from_slice(&payload)
        .map_err(|e| Error::Protocol(format!("invalid mount payload: {e}")))?;
    Ok(MountConfig {
        fuse_fd,
        volume_name: payload.volume_name,
    })
}
