//! Engine-neutral container creation parameters.
//!
//! The runtime's config mapper produces a [`CreateParams`]; each engine
//! backend translates it into its own request body. Nothing in this module
//! performs I/O.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateParams {
    /// Container name, or `None` to let the engine generate one.
    pub name: Option<String>,
    /// Fully qualified image reference.
    pub image: String,
    /// User the process runs as. Empty leaves the image default.
    pub user: String,
    /// Working directory. Empty leaves the image default.
    pub working_dir: String,
    /// Command arguments. Empty leaves the image default.
    pub command: Vec<String>,
    /// Entrypoint override. Empty leaves the image default.
    pub entrypoint: Vec<String>,
    /// Environment as `KEY=VALUE` strings.
    pub env: Vec<String>,
    /// Allocate a pseudo-terminal.
    pub tty: bool,
    /// Attach stdin/stdout/stderr and keep stdin open for exactly one attach.
    pub attach_stdio: bool,
    /// Exposed ports as `"<port>/<protocol>"` keys.
    pub exposed_ports: BTreeSet<String>,
    /// Host-side configuration.
    pub host: HostParams,
}

/// Host-side configuration of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostParams {
    /// Remove the container automatically once it exits.
    pub auto_remove: bool,
    /// Restart behaviour after exit.
    pub restart_policy: RestartPolicy,
    /// Filesystem mounts.
    pub mounts: Vec<MountEntry>,
    /// Host bindings keyed by `"<port>/<protocol>"`.
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    /// Additional kernel capabilities.
    pub cap_add: Vec<String>,
    /// Run an init process as PID 1.
    pub init: bool,
    /// Host devices passed through.
    pub devices: Vec<DeviceMapping>,
    /// Device cgroup rules.
    pub device_cgroup_rules: Vec<String>,
}

/// Restart behaviour of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    No,
    /// Always restart.
    Always,
}

/// A single generic mount entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Host path, volume name or image reference. `None` for tmpfs.
    pub source: Option<String>,
    /// Path inside the container.
    pub target: String,
    /// Mount read-only.
    pub read_only: bool,
    /// Kind-specific options.
    pub kind: MountKind,
}

/// Kind of a [`MountEntry`] along with its kind-specific options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MountKind {
    /// Host path bind.
    Bind {
        /// Whether the engine may create a missing mountpoint.
        create_mountpoint: bool,
    },
    /// Named volume.
    Volume {
        /// Sub-path within the volume.
        subpath: Option<String>,
    },
    /// Memory-backed filesystem.
    Tmpfs {
        /// Size limit in bytes.
        size_bytes: i64,
        /// Permission bits.
        mode: u32,
    },
    /// Read an image's filesystem as a mount.
    Image {
        /// Sub-path within the image.
        subpath: Option<String>,
    },
}

/// A host port binding. `None` lets the engine pick a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host port.
    pub host_port: Option<u16>,
}

/// A host device passed into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapping {
    /// Device path on the host.
    pub path_on_host: String,
    /// Device path inside the container.
    pub path_in_container: String,
    /// Cgroup permissions such as `rwm`.
    pub cgroup_permissions: String,
}
