pub mod config;
pub mod error;
pub mod relay;
pub mod registry;
pub mod util;

pub use config::{MountConfig, MountPayload, prepare_mount_config};
pub use error::{Error, Result};
pub use registry::SocketRegistry;
pub use util::{
    Endpoint, VolumeLocks, empty_dir_path, parse_endpoint, parse_labels, parse_pod_id_volume,
};
