//! Small parsing helpers shared by the driver binaries.

use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Where kubelet keeps per-pod volume trees unless configured otherwise.
pub const DEFAULT_KUBELET_PODS_ROOT: &str = "/var/lib/kubelet/pods";

const CSI_VOLUMES_SEGMENT: &str = "/volumes/kubernetes.io~csi/";
const EMPTY_DIR_SEGMENT: &str = "volumes/kubernetes.io~empty-dir";
const MOUNT_SUFFIX: &str = "/mount";

/// A parsed RPC endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

/// Parses `unix:<path>` / `tcp:<host:port>` endpoint strings. With
/// `cleanup_socket`, a stale unix socket file left over from a previous
/// run is removed.
pub fn parse_endpoint(endpoint: &str, cleanup_socket: bool) -> Result<Endpoint> {
    if let Some(rest) = endpoint.strip_prefix("unix:") {
        let path = rest.trim_start_matches("//");
        if path.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "unix endpoint {endpoint:?} has no path"
            )));
        }
        let path = PathBuf::from(path);
        if cleanup_socket {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(socket = %path.display(), "removed stale endpoint socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        return Ok(Endpoint::Unix(path));
    }

    if let Some(rest) = endpoint.strip_prefix("tcp:") {
        let addr = rest.trim_start_matches("//");
        if addr.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "tcp endpoint {endpoint:?} has no address"
            )));
        }
        return Ok(Endpoint::Tcp(addr.to_string()));
    }

    Err(Error::InvalidArgument(format!(
        "unsupported endpoint scheme in {endpoint:?}"
    )))
}

/// Extracts the pod id and volume name from a kubelet CSI target path:
/// `<pods_root>/<pod-id>/volumes/kubernetes.io~csi/<volume>/mount`.
pub fn parse_pod_id_volume(pods_root: &Path, target: &Path) -> Result<(String, String)> {
    let malformed = || {
        Error::InvalidArgument(format!(
            "target path {target:?} does not contain pod id or volume information"
        ))
    };

    let target_str = target.to_str().ok_or_else(malformed)?;
    let root_str = pods_root.to_str().ok_or_else(malformed)?;

    let rest = target_str
        .strip_prefix(root_str)
        .and_then(|r| r.strip_prefix('/'))
        .ok_or_else(malformed)?;
    let idx = rest.find(CSI_VOLUMES_SEGMENT).ok_or_else(malformed)?;
    let pod_id = &rest[..idx];
    let volume = rest[idx + CSI_VOLUMES_SEGMENT.len()..]
        .strip_suffix(MOUNT_SUFFIX)
        .ok_or_else(malformed)?;

    if pod_id.is_empty() || volume.is_empty() || volume.contains('/') {
        return Err(malformed());
    }

    Ok((pod_id.to_string(), volume.to_string()))
}

/// Path of a named emptyDir volume inside a pod's kubelet tree.
pub fn empty_dir_path(pods_root: &Path, pod_id: &str, empty_dir_name: &str) -> PathBuf {
    pods_root
        .join(pod_id)
        .join(EMPTY_DIR_SEGMENT)
        .join(empty_dir_name)
}

/// Parses `key1=value1,key2=value2` label strings.
///
/// Keys are 1-63 characters, start with a lowercase letter and contain
/// only lowercase letters, digits, `_` and `-`; values may be empty and
/// are limited to 63 characters of the same alphabet. At most 64 labels.
pub fn parse_labels(labels: &str) -> Result<HashMap<String, String>> {
    const MAX_LABELS: usize = 64;

    let mut map = HashMap::new();
    if labels.is_empty() {
        return Ok(map);
    }

    for pair in labels.split(',') {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            Error::InvalidArgument(format!(
                "labels {labels:?} are invalid, correct format: 'key1=value1,key2=value2'"
            ))
        })?;
        let key = key.trim();
        let value = value.trim();
        validate_label_key(key)?;
        validate_label_value(value)?;
        map.insert(key.to_string(), value.to_string());
    }

    if map.len() > MAX_LABELS {
        return Err(Error::InvalidArgument(format!(
            "more than {MAX_LABELS} labels is not allowed, given: {}",
            map.len()
        )));
    }

    Ok(map)
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'
}

fn validate_label_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let starts_lowercase = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    if key.len() > 63 || !starts_lowercase || !chars.all(is_label_char) {
        return Err(Error::InvalidArgument(format!(
            "label key {key:?} is invalid (must start with a lowercase letter, use only \
             lowercase letters, digits, '_' and '-', and be 1-63 characters)"
        )));
    }
    Ok(())
}

fn validate_label_value(value: &str) -> Result<()> {
    if value.len() > 63 || !value.chars().all(is_label_char) {
        return Err(Error::InvalidArgument(format!(
            "label value {value:?} is invalid (only lowercase letters, digits, '_' and '-' \
             are allowed, up to 63 characters)"
        )));
    }
    Ok(())
}

/// In-flight operation locks, one per target path. A second operation on
/// the same target is rejected rather than queued.
#[derive(Debug, Default)]
pub struct VolumeLocks {
    held: Mutex<HashSet<String>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `key`, or returns `None` when an operation for
    /// it is already in flight. The lock is released when the guard drops.
    pub fn try_acquire(&self, key: &str) -> Option<VolumeLockGuard<'_>> {
        let mut held = self.held.lock().unwrap();
        if !held.insert(key.to_string()) {
            return None;
        }
        Some(VolumeLockGuard {
            locks: self,
            key: key.to_string(),
        })
    }
}

pub struct VolumeLockGuard<'a> {
    locks: &'a VolumeLocks,
    key: String,
}

impl Drop for VolumeLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().unwrap().remove(&self.key);
    }
}
