//! RPC surface between the kubelet-facing endpoint and the fusepass node
//! driver.
//!
//! The request shapes mirror the CSI node-service contract for ephemeral
//! volumes; the transport is the plugin's own (length-delimited bincode
//! over a unix or tcp endpoint).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// NodePublishVolume volume-context keys.
pub const VOLUME_CONTEXT_KEY_SERVICE_ACCOUNT_NAME: &str = "csi.storage.k8s.io/serviceAccount.name";
pub const VOLUME_CONTEXT_KEY_SERVICE_ACCOUNT_TOKENS: &str =
    "csi.storage.k8s.io/serviceAccount.tokens";
pub const VOLUME_CONTEXT_KEY_POD_NAME: &str = "csi.storage.k8s.io/pod.name";
pub const VOLUME_CONTEXT_KEY_POD_NAMESPACE: &str = "csi.storage.k8s.io/pod.namespace";
pub const VOLUME_CONTEXT_KEY_EPHEMERAL: &str = "csi.storage.k8s.io/ephemeral";
pub const VOLUME_CONTEXT_KEY_MOUNT_OPTIONS: &str = "mountOptions";
pub const VOLUME_CONTEXT_KEY_FD_PASSING_EMPTY_DIR_NAME: &str = "fdPassingEmptyDirName";
pub const VOLUME_CONTEXT_KEY_FD_PASSING_SOCKET_NAME: &str = "fdPassingSocketName";

pub type RpcResult<T> = Result<T, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
}

/// Optional node-service capabilities. The driver currently advertises
/// none of them; the set exists so the surface matches what a CSI node
/// plugin is asked for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
    VolumeCondition,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    Mount { mount_flags: Vec<String> },
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    pub access_type: AccessType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub target_path: PathBuf,
    pub volume_capability: VolumeCapability,
    pub volume_context: HashMap<String, String>,
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: PathBuf,
}

#[tarpc::service]
pub trait Node {
    /// Driver name and version.
    async fn get_plugin_info() -> PluginInfo;
    /// Identity of the node this driver instance runs on.
    async fn node_get_info() -> NodeInfo;
    /// Optional capabilities this driver advertises.
    async fn node_get_capabilities() -> Vec<NodeCapability>;
    /// Mounts an ephemeral FUSE volume and publishes its descriptor.
    /// Idempotent for an already-mounted target.
    async fn node_publish_volume(req: NodePublishVolumeRequest) -> RpcResult<()>;
    /// Unmounts the target and tears down its fd-passing state.
    async fn node_unpublish_volume(req: NodeUnpublishVolumeRequest) -> RpcResult<()>;
}
