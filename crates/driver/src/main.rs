//! fusepass CSI node driver.
//!
//! Serves the node RPC surface and performs the privileged half of every
//! FUSE mount: the kernel mount itself plus the descriptor handoff to the
//! unprivileged sidecar.

mod mounter;
mod node;

use anyhow::Context as _;
use clap::Parser;
use fusepass_core::util::DEFAULT_KUBELET_PODS_ROOT;
use fusepass_core::{Endpoint, SocketRegistry, parse_endpoint};
use fusepass_proto::Node;
use futures::prelude::*;
use mounter::{ForceUnmounter, FuseMounter};
use node::{DEFAULT_DRIVER_NAME, DriverConfig, NodeServer};
use std::path::PathBuf;
use std::sync::Arc;
use tarpc::server::{BaseChannel, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tarpc::tokio_util::codec::LengthDelimitedCodec;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "fusepass-csi-driver",
    version,
    about = "CSI node driver that mounts FUSE volumes and relays their descriptors to pod sidecars"
)]
struct Args {
    /// Endpoint the node service listens on.
    #[arg(long, default_value = "unix:/tmp/csi.sock")]
    endpoint: String,

    /// Kubernetes node name this driver instance runs on.
    #[arg(long = "nodeid")]
    node_id: String,

    /// Root of the kubelet pod-volume tree.
    #[arg(long, default_value = DEFAULT_KUBELET_PODS_ROOT)]
    kubelet_pods_root: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    anyhow::ensure!(!args.node_id.is_empty(), "node id cannot be empty");

    let registry = Arc::new(SocketRegistry::new());
    let mounter: Arc<dyn ForceUnmounter> = Arc::new(FuseMounter::new(Arc::clone(&registry)));
    let server = NodeServer::new(
        DriverConfig {
            name: DEFAULT_DRIVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            node_id: args.node_id.clone(),
            kubelet_pods_root: args.kubelet_pods_root.clone(),
        },
        mounter,
        registry,
    );

    let endpoint = parse_endpoint(&args.endpoint, true)
        .with_context(|| format!("invalid endpoint {:?}", args.endpoint))?;
    info!(
        driver = DEFAULT_DRIVER_NAME,
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %args.endpoint,
        node = %args.node_id,
        "fusepass CSI driver starting"
    );

    match endpoint {
        Endpoint::Unix(path) => {
            let listener = tokio::net::UnixListener::bind(&path)
                .with_context(|| format!("failed to bind {}", path.display()))?;
            loop {
                let (stream, _addr) = listener.accept().await?;
                serve_connection(stream, server.clone());
            }
        }
        Endpoint::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            loop {
                let (stream, _addr) = listener.accept().await?;
                serve_connection(stream, server.clone());
            }
        }
    }
}

fn serve_connection<S>(stream: S, server: NodeServer)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let framed = LengthDelimitedCodec::builder().new_framed(stream);
    let transport = tarpc::serde_transport::new(framed, Bincode::default());

    tokio::spawn(
        BaseChannel::with_defaults(transport)
            .execute(server.serve())
            .for_each(|response| async move {
                tokio::spawn(response);
            }),
    );
}
