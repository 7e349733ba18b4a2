use std::path::PathBuf;

/// Errors that can occur while relaying a FUSE descriptor between the
/// privileged driver and its consumers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("relay protocol violation: {0}")]
    Protocol(String),

    #[error("fd-passing socket for {0:?} is already registered")]
    AlreadyRegistered(PathBuf),

    #[error("no fd-passing socket registered for {0:?}")]
    NotRegistered(PathBuf),

    #[error("fd-passing socket for {0:?} was closed")]
    ListenerClosed(PathBuf),

    #[error("privileged mount operation failed: {0}")]
    PrivilegedOp(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
