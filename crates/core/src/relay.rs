//! Descriptor relay over connected Unix domain sockets.
//!
//! One relay message carries exactly one open file descriptor as
//! `SCM_RIGHTS` ancillary data together with a small opaque payload as
//! ordinary data, both delivered by a single `sendmsg(2)` call. The
//! receiving side gets a fresh descriptor number referring to the same
//! kernel object; the returned [`OwnedFd`] closes it on drop.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, SockaddrStorage, UnixAddr, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Upper bound on the opaque payload accompanying a descriptor. Payloads
/// are small serialized records (a volume identifier and the like), never
/// bulk data.
pub const MAX_PAYLOAD: usize = 512;

/// Sends `fd` and `payload` over `conn` as one message.
///
/// The payload must be non-empty: a zero-length datagram is
/// indistinguishable from the peer closing the connection.
pub fn send_message(conn: &UnixStream, fd: BorrowedFd<'_>, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Err(Error::Protocol("payload must not be empty".to_string()));
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Protocol(format!(
            "payload of {} bytes exceeds the {MAX_PAYLOAD} byte limit",
            payload.len()
        )));
    }

    let iov = [IoSlice::new(payload)];
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    let sent = loop {
        match sendmsg::<UnixAddr>(conn.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Transport(io_error(e))),
        }
    };

    if sent != payload.len() {
        return Err(Error::Transport(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("short send: {sent} of {} payload bytes", payload.len()),
        )));
    }

    Ok(())
}

/// Receives one relay message from `conn`, blocking until it arrives.
///
/// Returns the received descriptor and the payload bytes. The descriptor
/// is owned by the caller and closed exactly once when the returned
/// [`OwnedFd`] drops.
pub fn recv_message(conn: &UnixStream) -> Result<(OwnedFd, Vec<u8>)> {
    let mut buf = vec![0u8; MAX_PAYLOAD];

    let (received, raw_fd) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        // Room for two descriptors, so an over-send shows up as a countable
        // protocol violation instead of kernel-side truncation.
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 2]);

        let msg = loop {
            match recvmsg::<SockaddrStorage>(
                conn.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            ) {
                Ok(msg) => break msg,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Transport(io_error(e))),
            }
        };

        if msg.bytes == 0 {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the connection before sending a message",
            )));
        }

        if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
            return Err(Error::Protocol(
                "ancillary data was truncated by the kernel".to_string(),
            ));
        }

        let mut fds: Vec<RawFd> = Vec::new();
        for cmsg in msg
            .cmsgs()
            .map_err(|e| Error::Protocol(format!("malformed control message: {e}")))?
        {
            match cmsg {
                ControlMessageOwned::ScmRights(received) => fds.extend(received),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected control message {other:?}"
                    )));
                }
            }
        }

        if fds.len() != 1 {
            // Anything the kernel already installed must not leak.
            for fd in fds.iter().copied() {
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
            }
            return Err(Error::Protocol(format!(
                "expected exactly one descriptor, got {}",
                fds.len()
            )));
        }

        (msg.bytes, fds[0])
    };

    let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };
    buf.truncate(received);
    Ok((fd, buf))
}

fn io_error(errno: Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;

    #[test]
    fn round_trip_preserves_payload_and_kernel_object() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();

        send_message(&tx, file.as_fd(), b"volume-record").unwrap();
        let (fd, payload) = recv_message(&rx).unwrap();
        assert_eq!(payload, b"volume-record");

        // Writing through the received descriptor must be visible through
        // the sender's descriptor: both refer to the same open file.
        let mut received = File::from(fd);
        received.write_all(b"shared").unwrap();
        received.flush().unwrap();

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "shared");
    }

    #[test]
    fn empty_payload_is_rejected() {
        let (tx, _rx) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        let err = send_message(&tx, file.as_fd(), b"").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (tx, _rx) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        let err = send_message(&tx, file.as_fd(), &payload).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn message_without_descriptor_is_a_protocol_error() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"no descriptor here").unwrap();
        let err = recv_message(&rx).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    }

    #[test]
    fn message_with_two_descriptors_is_a_protocol_error() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let a = tempfile::tempfile().unwrap();
        let b = tempfile::tempfile().unwrap();

        let iov = [IoSlice::new(b"x")];
        let fds = [a.as_raw_fd(), b.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        sendmsg::<UnixAddr>(tx.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None).unwrap();

        let err = recv_message(&rx).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    }

    #[test]
    fn peer_close_is_a_transport_error() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        let err = recv_message(&rx).unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "got {err:?}");
    }
}
