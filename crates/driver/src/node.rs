//! Node-service implementation: the kubelet-facing publish/unpublish
//! surface in front of the mount orchestrator.

use crate::mounter::{ForceUnmounter, Mounter};
use fusepass_core::{SocketRegistry, VolumeLocks, util};
use fusepass_proto::{
    AccessType, Node, NodeCapability, NodeInfo, NodePublishVolumeRequest,
    NodeUnpublishVolumeRequest, PluginInfo, RpcResult, VOLUME_CONTEXT_KEY_EPHEMERAL,
    VOLUME_CONTEXT_KEY_FD_PASSING_EMPTY_DIR_NAME, VOLUME_CONTEXT_KEY_FD_PASSING_SOCKET_NAME,
    VOLUME_CONTEXT_KEY_MOUNT_OPTIONS, VolumeCapability,
};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tarpc::context::Context;
use tracing::{info, warn};

pub const DEFAULT_DRIVER_NAME: &str = "fusepass.csi.storage.k8s.io";

const UNMOUNT_TIMEOUT: Duration = Duration::from_secs(5);

/// Static identity and environment of one driver process. Passed into the
/// node server explicitly; there is no process-wide driver state.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub name: String,
    pub version: String,
    pub node_id: String,
    pub kubelet_pods_root: PathBuf,
}

#[derive(Clone)]
pub struct NodeServer {
    config: Arc<DriverConfig>,
    mounter: Arc<dyn ForceUnmounter>,
    registry: Arc<SocketRegistry>,
    volume_locks: Arc<VolumeLocks>,
}

impl NodeServer {
    pub fn new(
        config: DriverConfig,
        mounter: Arc<dyn ForceUnmounter>,
        registry: Arc<SocketRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            mounter,
            registry,
            volume_locks: Arc::new(VolumeLocks::new()),
        }
    }

    fn validate_capability(capability: &VolumeCapability) -> Result<(), String> {
        // Every access mode in the protocol is acceptable for an ephemeral
        // FUSE volume; the access type has to be a mount.
        match capability.access_type {
            AccessType::Mount { .. } => Ok(()),
            AccessType::Block => Err("driver only supports mount access type volumes".to_string()),
        }
    }

    async fn publish(&self, req: NodePublishVolumeRequest) -> RpcResult<()> {
        let context = &req.volume_context;

        let mut options: Vec<String> = vec![if req.readonly { "ro" } else { "rw" }.to_string()];
        if let AccessType::Mount { mount_flags } = &req.volume_capability.access_type {
            options.extend(mount_flags.iter().cloned());
        }
        if let Some(extra) = context.get(VOLUME_CONTEXT_KEY_MOUNT_OPTIONS) {
            options.extend(extra.split(',').filter(|o| !o.is_empty()).map(String::from));
        }

        if context.get(VOLUME_CONTEXT_KEY_EPHEMERAL).map(String::as_str) != Some("true") {
            return Err(format!(
                "volume context {VOLUME_CONTEXT_KEY_EPHEMERAL:?} must be \"true\" for ephemeral storage"
            ));
        }

        let target = req.target_path.as_path();
        if target.as_os_str().is_empty() {
            return Err("target path must be provided".to_string());
        }

        Self::validate_capability(&req.volume_capability)?;

        let target_key = target.display().to_string();
        let Some(_lock) = self.volume_locks.try_acquire(&target_key) else {
            return Err(format!(
                "an operation with the given target path {target_key} already exists"
            ));
        };

        let (pod_id, volume_name) =
            util::parse_pod_id_volume(&self.config.kubelet_pods_root, target)
                .map_err(|e| e.to_string())?;

        let empty_dir_name = context
            .get(VOLUME_CONTEXT_KEY_FD_PASSING_EMPTY_DIR_NAME)
            .ok_or_else(|| {
                format!(
                    "volume context {VOLUME_CONTEXT_KEY_FD_PASSING_EMPTY_DIR_NAME:?} must be provided"
                )
            })?;
        let socket_name = context
            .get(VOLUME_CONTEXT_KEY_FD_PASSING_SOCKET_NAME)
            .ok_or_else(|| {
                format!(
                    "volume context {VOLUME_CONTEXT_KEY_FD_PASSING_SOCKET_NAME:?} must be provided"
                )
            })?;

        let mounted = self
            .mounter
            .is_mount_point(target)
            .map_err(|e| format!("failed to check if {target_key} is already mounted: {e}"))?;
        if mounted {
            info!(
                volume = %volume_name,
                target = %target_key,
                "publish succeeded, mount already exists"
            );
            return Ok(());
        }

        let empty_dir = util::empty_dir_path(&self.config.kubelet_pods_root, &pod_id, empty_dir_name);
        if !empty_dir.is_dir() {
            return Err(format!(
                "directory {} for emptyDir {empty_dir_name:?} does not exist",
                empty_dir.display()
            ));
        }

        let socket_path = empty_dir.join(socket_name);
        if socket_path.exists() {
            info!(
                volume = %volume_name,
                target = %target_key,
                "publish succeeded, fd-passing socket already waits for a connection"
            );
            return Ok(());
        }

        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(target)
            .map_err(|e| format!("mkdir failed for path {target_key}: {e}"))?;

        self.mounter
            .mount(&volume_name, target, &socket_path, &options)
            .await
            .map_err(|e| format!("failed to mount volume {volume_name:?} to {target_key}: {e}"))?;

        info!(volume = %volume_name, target = %target_key, "publish succeeded");
        Ok(())
    }

    async fn unpublish(&self, req: NodeUnpublishVolumeRequest) -> RpcResult<()> {
        let target = req.target_path.as_path();
        if target.as_os_str().is_empty() {
            return Err("target path must be provided".to_string());
        }

        let target_key = target.display().to_string();
        let Some(_lock) = self.volume_locks.try_acquire(&target_key) else {
            return Err(format!(
                "an operation with the given target path {target_key} already exists"
            ));
        };

        // Force unmount first: with the descriptor still owned by the
        // publish task, a regular unmount would hang on the dead mount.
        let mounted = match self.mounter.is_mount_point(target) {
            Ok(mounted) => mounted,
            Err(e) => {
                warn!(target = %target_key, error = %e, "failed to check mount state");
                true
            }
        };
        if mounted {
            self.mounter
                .unmount_force(target, UNMOUNT_TIMEOUT)
                .await
                .map_err(|e| format!("failed to force unmount target path {target_key}: {e}"))?;
        }

        let still_mounted = self
            .mounter
            .is_mount_point(target)
            .map_err(|e| format!("failed to check if {target_key} is mounted: {e}"))?;

        // A FUSE server that wrote into the directory before dying leaves
        // files that would make the mount point removal fail.
        if !still_mounted && target.is_dir() {
            remove_dir_children(target)
                .map_err(|e| format!("failed to remove children of {target_key}: {e}"))?;
        }

        if target.exists() {
            if still_mounted {
                self.mounter
                    .unmount(target)
                    .await
                    .map_err(|e| format!("failed to unmount target path {target_key}: {e}"))?;
            }
            std::fs::remove_dir(target)
                .map_err(|e| format!("failed to remove mount point {target_key}: {e}"))?;
        }

        // The publish task owns the FUSE descriptor until its registry
        // entry is gone; a floating descriptor would keep the mount busy.
        // Close the listener to unblock it, then wait for its exit.
        if !self.registry.exists(target) {
            info!(target = %target_key, "fd-passing socket already unregistered");
        } else if let Err(e) = self.registry.close_and_unregister(target, true) {
            warn!(target = %target_key, error = %e, "failed to close fd-passing socket");
        } else {
            self.registry.wait_for_exit(target).await;
            info!(target = %target_key, "fd-passing socket closed");
        }

        info!(target = %target_key, "unpublish succeeded");
        Ok(())
    }
}

impl Node for NodeServer {
    async fn get_plugin_info(self, _: Context) -> PluginInfo {
        PluginInfo {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
        }
    }

    async fn node_get_info(self, _: Context) -> NodeInfo {
        NodeInfo {
            node_id: self.config.node_id.clone(),
        }
    }

    async fn node_get_capabilities(self, _: Context) -> Vec<NodeCapability> {
        Vec::new()
    }

    async fn node_publish_volume(self, _: Context, req: NodePublishVolumeRequest) -> RpcResult<()> {
        self.publish(req).await
    }

    async fn node_unpublish_volume(
        self,
        _: Context,
        req: NodeUnpublishVolumeRequest,
    ) -> RpcResult<()> {
        self.unpublish(req).await
    }
}

fn remove_dir_children(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounter::{Mounter, MountPoint};
    use async_trait::async_trait;
    use fusepass_core::Result;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tarpc::context;

    #[derive(Debug, Clone)]
    struct MountCall {
        volume_id: String,
        target: PathBuf,
        socket_path: PathBuf,
        options: Vec<String>,
    }

    #[derive(Default)]
    struct MockMounter {
        mounted: Mutex<HashSet<PathBuf>>,
        mount_calls: Mutex<Vec<MountCall>>,
        force_unmounts: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Mounter for MockMounter {
        async fn mount(
            &self,
            volume_id: &str,
            target: &Path,
            socket_path: &Path,
            options: &[String],
        ) -> Result<()> {
            self.mount_calls.lock().unwrap().push(MountCall {
                volume_id: volume_id.to_string(),
                target: target.to_path_buf(),
                socket_path: socket_path.to_path_buf(),
                options: options.to_vec(),
            });
            self.mounted.lock().unwrap().insert(target.to_path_buf());
            Ok(())
        }

        async fn unmount(&self, target: &Path) -> Result<()> {
            self.mounted.lock().unwrap().remove(target);
            Ok(())
        }

        fn list(&self) -> Result<Vec<MountPoint>> {
            Ok(self
                .mounted
                .lock()
                .unwrap()
                .iter()
                .map(|path| MountPoint {
                    device: "mock".to_string(),
                    path: path.clone(),
                    fstype: "fuse".to_string(),
                })
                .collect())
        }
    }

    #[async_trait]
    impl ForceUnmounter for MockMounter {
        async fn unmount_force(&self, target: &Path, _timeout: Duration) -> Result<()> {
            self.force_unmounts.lock().unwrap().push(target.to_path_buf());
            self.mounted.lock().unwrap().remove(target);
            Ok(())
        }
    }

    struct Fixture {
        server: NodeServer,
        mounter: Arc<MockMounter>,
        registry: Arc<SocketRegistry>,
        pods_root: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let pods_root = tempfile::tempdir().unwrap();
        let mounter = Arc::new(MockMounter::default());
        let registry = Arc::new(SocketRegistry::new());
        let config = DriverConfig {
            name: DEFAULT_DRIVER_NAME.to_string(),
            version: "test".to_string(),
            node_id: "node-1".to_string(),
            kubelet_pods_root: pods_root.path().to_path_buf(),
        };
        let server = NodeServer::new(
            config,
            Arc::clone(&mounter) as Arc<dyn ForceUnmounter>,
            Arc::clone(&registry),
        );
        Fixture {
            server,
            mounter,
            registry,
            pods_root,
        }
    }

    impl Fixture {
        fn target(&self) -> PathBuf {
            self.pods_root
                .path()
                .join("pod-1/volumes/kubernetes.io~csi/vol-1/mount")
        }

        fn empty_dir(&self) -> PathBuf {
            self.pods_root
                .path()
                .join("pod-1/volumes/kubernetes.io~empty-dir/fuse-fd")
        }

        fn publish_request(&self) -> NodePublishVolumeRequest {
            NodePublishVolumeRequest {
                volume_id: "vol-1".to_string(),
                target_path: self.target(),
                volume_capability: VolumeCapability {
                    access_mode: fusepass_proto::AccessMode::SingleNodeWriter,
                    access_type: AccessType::Mount {
                        mount_flags: vec![],
                    },
                },
                volume_context: HashMap::from([
                    (VOLUME_CONTEXT_KEY_EPHEMERAL.to_string(), "true".to_string()),
                    (
                        VOLUME_CONTEXT_KEY_FD_PASSING_EMPTY_DIR_NAME.to_string(),
                        "fuse-fd".to_string(),
                    ),
                    (
                        VOLUME_CONTEXT_KEY_FD_PASSING_SOCKET_NAME.to_string(),
                        "fuse-fd.sock".to_string(),
                    ),
                ]),
                readonly: false,
            }
        }
    }

    #[tokio::test]
    async fn reports_plugin_and_node_identity() {
        let fx = fixture();
        let info = fx.server.clone().get_plugin_info(context::current()).await;
        assert_eq!(info.name, DEFAULT_DRIVER_NAME);

        let node = fx.server.clone().node_get_info(context::current()).await;
        assert_eq!(node.node_id, "node-1");

        let caps = fx
            .server
            .clone()
            .node_get_capabilities(context::current())
            .await;
        assert!(caps.is_empty());
    }

    #[tokio::test]
    async fn publish_rejects_non_ephemeral_volumes() {
        let fx = fixture();
        let mut req = fx.publish_request();
        req.volume_context
            .remove(VOLUME_CONTEXT_KEY_EPHEMERAL)
            .unwrap();

        let err = fx
            .server
            .clone()
            .node_publish_volume(context::current(), req)
            .await
            .unwrap_err();
        assert!(err.contains("ephemeral"), "got {err}");
        assert!(fx.mounter.mount_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_rejects_empty_target_path() {
        let fx = fixture();
        let mut req = fx.publish_request();
        req.target_path = PathBuf::new();

        let err = fx
            .server
            .clone()
            .node_publish_volume(context::current(), req)
            .await
            .unwrap_err();
        assert!(err.contains("target path"), "got {err}");
    }

    #[tokio::test]
    async fn publish_rejects_block_access_type() {
        let fx = fixture();
        let mut req = fx.publish_request();
        req.volume_capability.access_type = AccessType::Block;

        let err = fx
            .server
            .clone()
            .node_publish_volume(context::current(), req)
            .await
            .unwrap_err();
        assert!(err.contains("mount access type"), "got {err}");
    }

    #[tokio::test]
    async fn publish_requires_fd_passing_context_keys() {
        let fx = fixture();
        let mut req = fx.publish_request();
        req.volume_context
            .remove(VOLUME_CONTEXT_KEY_FD_PASSING_SOCKET_NAME)
            .unwrap();

        let err = fx
            .server
            .clone()
            .node_publish_volume(context::current(), req)
            .await
            .unwrap_err();
        assert!(err.contains("fdPassingSocketName"), "got {err}");
    }

    #[tokio::test]
    async fn publish_mounts_through_the_fd_passing_socket() {
        let fx = fixture();
        std::fs::create_dir_all(fx.empty_dir()).unwrap();

        fx.server
            .clone()
            .node_publish_volume(context::current(), fx.publish_request())
            .await
            .unwrap();

        let calls = fx.mounter.mount_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].volume_id, "vol-1");
        assert_eq!(calls[0].target, fx.target());
        assert_eq!(calls[0].socket_path, fx.empty_dir().join("fuse-fd.sock"));
        assert!(calls[0].options.contains(&"rw".to_string()));
        assert!(fx.target().is_dir());
    }

    #[tokio::test]
    async fn publish_merges_capability_flags_and_context_options() {
        let fx = fixture();
        std::fs::create_dir_all(fx.empty_dir()).unwrap();

        let mut req = fx.publish_request();
        req.readonly = true;
        req.volume_capability.access_type = AccessType::Mount {
            mount_flags: vec!["noexec".to_string()],
        };
        req.volume_context.insert(
            VOLUME_CONTEXT_KEY_MOUNT_OPTIONS.to_string(),
            "noatime,o=sync".to_string(),
        );

        fx.server
            .clone()
            .node_publish_volume(context::current(), req)
            .await
            .unwrap();

        let calls = fx.mounter.mount_calls.lock().unwrap();
        let options = &calls[0].options;
        for expected in ["ro", "noexec", "noatime", "o=sync"] {
            assert!(
                options.contains(&expected.to_string()),
                "missing {expected} in {options:?}"
            );
        }
        assert!(!options.contains(&"rw".to_string()));
    }

    #[tokio::test]
    async fn publish_is_idempotent_for_a_mounted_target() {
        let fx = fixture();
        fx.mounter.mounted.lock().unwrap().insert(fx.target());

        fx.server
            .clone()
            .node_publish_volume(context::current(), fx.publish_request())
            .await
            .unwrap();
        assert!(fx.mounter.mount_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_is_idempotent_while_the_socket_waits() {
        let fx = fixture();
        std::fs::create_dir_all(fx.empty_dir()).unwrap();
        std::fs::write(fx.empty_dir().join("fuse-fd.sock"), b"").unwrap();

        fx.server
            .clone()
            .node_publish_volume(context::current(), fx.publish_request())
            .await
            .unwrap();
        assert!(fx.mounter.mount_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_fails_when_the_empty_dir_is_missing() {
        let fx = fixture();
        let err = fx
            .server
            .clone()
            .node_publish_volume(context::current(), fx.publish_request())
            .await
            .unwrap_err();
        assert!(err.contains("does not exist"), "got {err}");
    }

    #[tokio::test]
    async fn unpublish_force_unmounts_and_tears_down_the_registry() {
        let fx = fixture();
        let target = fx.target();
        std::fs::create_dir_all(&target).unwrap();
        fx.mounter.mounted.lock().unwrap().insert(target.clone());

        // A publish task parked in accept, as after a mount nobody consumed.
        let socket_dir = tempfile::tempdir().unwrap();
        let socket_path = socket_dir.path().join("fd.sock");
        fx.registry.register(&target, &socket_path).unwrap();
        let publish_task = {
            let registry = Arc::clone(&fx.registry);
            let target = target.clone();
            tokio::spawn(async move {
                let result = registry.accept(&target).await;
                registry.close_and_unregister(&target, false).unwrap();
                result
            })
        };

        fx.server
            .clone()
            .node_unpublish_volume(
                context::current(),
                NodeUnpublishVolumeRequest {
                    volume_id: "vol-1".to_string(),
                    target_path: target.clone(),
                },
            )
            .await
            .unwrap();

        // The parked accept was unblocked and the entry fully released.
        let accept_result = publish_task.await.unwrap();
        assert!(accept_result.is_err());
        assert_eq!(
            fx.mounter.force_unmounts.lock().unwrap().as_slice(),
            &[target.clone()]
        );
        assert!(!fx.registry.exists(&target));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn unpublish_is_idempotent_when_nothing_is_mounted() {
        let fx = fixture();

        fx.server
            .clone()
            .node_unpublish_volume(
                context::current(),
                NodeUnpublishVolumeRequest {
                    volume_id: "vol-1".to_string(),
                    target_path: fx.target(),
                },
            )
            .await
            .unwrap();
        assert!(fx.mounter.force_unmounts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unpublish_clears_stray_files_from_the_target() {
        let fx = fixture();
        let target = fx.target();
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("leftover"), b"data").unwrap();

        fx.server
            .clone()
            .node_unpublish_volume(
                context::current(),
                NodeUnpublishVolumeRequest {
                    volume_id: "vol-1".to_string(),
                    target_path: target.clone(),
                },
            )
            .await
            .unwrap();
        assert!(!target.exists());
    }
}
