//! Drop-in replacement for `fusermount3`.
//!
//! FUSE libraries that do not already hold a `/dev/fuse` descriptor shell
//! out to `fusermount3` and expect the descriptor back over a socket they
//! pass via `_FUSE_COMMFD`. Inside a fusepass pod the mount already
//! exists, performed by the CSI driver; this helper fetches a fresh
//! descriptor for it over the driver's fd-passing socket and re-emits it
//! to the caller in the shape the library expects: the descriptor as
//! ancillary data plus a single zero status byte. It never mounts and
//! never unmounts.

use anyhow::Context as _;
use clap::Parser;
use fusepass_core::{prepare_mount_config, relay};
use nix::fcntl::{FcntlArg, fcntl};
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable libfuse uses to hand the helper its communication
/// socket.
const ENV_FUSE_COMMFD: &str = "_FUSE_COMMFD";
/// Environment variable naming the fd-passing socket toward the CSI
/// driver.
const ENV_FD_PASSING_SOCKET_PATH: &str = "FUSERMOUNT3PROXY_FDPASSING_SOCKPATH";

#[derive(Parser, Debug)]
#[command(
    name = "fusermount3-proxy",
    version,
    about = "fusermount3 replacement that fetches an already-mounted FUSE descriptor from the CSI driver"
)]
struct Args {
    /// Unmount the filesystem (accepted for compatibility, not supported).
    #[arg(short = 'u', long)]
    unmount: bool,

    /// Auto-unmount on process exit (accepted for compatibility, not
    /// supported).
    #[arg(short = 'U', long = "auto-unmount")]
    auto_unmount: bool,

    /// Lazy unmount (accepted for compatibility, not supported).
    #[arg(short = 'z', long)]
    lazy: bool,

    /// Quiet operation (accepted for compatibility, not supported).
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Mount options. Informational only; the mount already exists.
    #[arg(short = 'o', long)]
    options: Option<String>,

    /// Mountpoint. Informational only; the mount already exists.
    mountpoint: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "fusermount3-proxy starting");

    if args.unmount {
        warn!("unmount requested, but this helper never unmounts");
        return Ok(());
    }
    for (flag, set) in [
        ("auto-unmount", args.auto_unmount),
        ("lazy", args.lazy),
        ("quiet", args.quiet),
    ] {
        if set {
            warn!(flag, "option is not supported and will be ignored");
        }
    }

    let mountpoint = args.mountpoint.context("mountpoint is not specified")?;
    let options = args.options.context("options are not specified")?;
    info!(
        mountpoint = %mountpoint.display(),
        options = %options,
        "mount was already performed by the CSI driver, arguments are informational"
    );

    let socket_path = std::env::var(ENV_FD_PASSING_SOCKET_PATH)
        .with_context(|| format!("environment variable {ENV_FD_PASSING_SOCKET_PATH} is not set"))?;
    let comm = commfd_stream()?;

    let config = prepare_mount_config(Path::new(&socket_path)).with_context(|| {
        format!("failed to receive the mount descriptor via socket {socket_path:?}")
    })?;
    info!(
        volume = %config.volume_name,
        socket = %socket_path,
        "received descriptor for the mounted filesystem"
    );

    // The helper wire contract: the descriptor plus one zero byte meaning
    // success.
    relay::send_message(&comm, config.fuse_fd.as_fd(), &[0])
        .context("failed to relay the descriptor to the caller")?;
    info!("descriptor relayed to the caller");

    Ok(())
}

/// Takes ownership of the communication socket the caller passed down via
/// `_FUSE_COMMFD`.
fn commfd_stream() -> anyhow::Result<UnixStream> {
    let value = std::env::var(ENV_FUSE_COMMFD)
        .with_context(|| format!("environment variable {ENV_FUSE_COMMFD} is not set"))?;
    stream_from_commfd(&value)
}

fn stream_from_commfd(value: &str) -> anyhow::Result<UnixStream> {
    let raw: RawFd = value
        .parse()
        .with_context(|| format!("{ENV_FUSE_COMMFD} value {value:?} is not a descriptor number"))?;
    anyhow::ensure!(raw >= 0, "{ENV_FUSE_COMMFD} value {raw} is negative");
    fcntl(raw, FcntlArg::F_GETFD)
        .with_context(|| format!("descriptor {raw} from {ENV_FUSE_COMMFD} is not open"))?;

    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    Ok(UnixStream::from(fd))
}
