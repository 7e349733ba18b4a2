//! fusepass sidecar starter.
//!
//! Runs unprivileged next to the workload, receives the `/dev/fuse`
//! descriptor published by the CSI driver and execs the actual
//! FUSE-serving program with that descriptor inherited, then supervises
//! it until it exits.

mod starter;
mod supervisor;

use anyhow::Context as _;
use clap::Parser;
use fusepass_core::prepare_mount_config;
use starter::FuseStarter;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "fusepass-starter",
    version,
    about = "Receives a FUSE descriptor from the CSI driver and supervises the FUSE implementation"
)]
struct Args {
    /// Unix socket the CSI driver publishes the descriptor on.
    #[arg(long = "fd-passing-socket-path")]
    fd_passing_socket_path: PathBuf,

    /// FUSE implementation command, given after `--`.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let (program, program_args) = args
        .command
        .split_first()
        .context("the fuse implementation command must be given after --")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %args.fd_passing_socket_path.display(),
        program = %program,
        "fusepass starter starting"
    );

    let config = prepare_mount_config(&args.fd_passing_socket_path).with_context(|| {
        format!(
            "failed to prepare mount config from socket {}",
            args.fd_passing_socket_path.display()
        )
    })?;

    let fuse_starter = FuseStarter::new(PathBuf::from(program), program_args.to_vec());

    // One child to supervise; a current-thread runtime is all this needs.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let status = runtime.block_on(async {
        let child = fuse_starter.start(config)?;
        child.supervise().await
    })?;

    // The sidecar's exit is the observable signal that the served
    // filesystem is gone; propagate the child's disposition.
    std::process::exit(status.code().unwrap_or_else(|| {
        128 + status.signal().unwrap_or(0)
    }));
}
