//! Declarative description of a process to run inside a container.
//!
//! A [`RunSpec`] is plain data. It is built once (usually through the SDK
//! builder), handed to the runtime, and consumed by a single run.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Image reference the container is created from.
    pub image: String,
    /// Process to execute.
    #[serde(default)]
    pub process: ProcessSpec,
    /// Terminal and stdio attachment settings.
    #[serde(default)]
    pub terminal: TerminalSpec,
    /// Environment variables, in order. Later duplicates win at the engine.
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    /// Published ports, in order.
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    /// Filesystem and device mounts, in order.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Linux capabilities added to the container.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Optional unique container name.
    #[serde(default)]
    pub name: Option<String>,
}

impl RunSpec {
    /// Creates a run specification for the given image with all other
    /// settings left empty.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }
}

/// Process settings for the container's main command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// User (name or uid[:gid]) the process runs as.
    #[serde(default)]
    pub user: String,
    /// Working directory inside the container.
    #[serde(default)]
    pub working_dir: String,
    /// Command arguments.
    #[serde(default)]
    pub command: Vec<String>,
    /// Entrypoint override.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Script to install and run in place of the entrypoint.
    #[serde(default)]
    pub script: Option<EntrypointScript>,
}

/// A shell script provisioned into the container before it starts.
///
/// The script is written into a per-container scratch directory and run by
/// `interpreter`, `/bin/sh` when empty. An interactive script is still
/// written, but the interpreter is started bare so it reads the terminal,
/// and the command arguments are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrypointScript {
    /// Script body.
    pub script: String,
    /// Interpreter command line.
    #[serde(default)]
    pub interpreter: Vec<String>,
    /// Start the interpreter without the script.
    #[serde(default)]
    pub interactive: bool,
}

/// Terminal settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSpec {
    /// Allocate a pseudo-terminal.
    #[serde(default)]
    pub tty: bool,
    /// Attach the caller's stdio (interactive, foreground run).
    #[serde(default)]
    pub stdio: bool,
}

/// A single environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub key: String,
    /// Variable value.
    pub value: String,
}

impl EnvVar {
    /// Creates an environment variable.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
    /// SCTP.
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Sctp => write!(f, "sctp"),
        }
    }
}

/// A container port published on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
    /// Port inside the container.
    pub container_port: u16,
    /// Host port; `None` lets the engine choose one.
    #[serde(default)]
    pub host_port: Option<u16>,
}

impl PortSpec {
    /// Returns the engine key for this port, e.g. `8080/tcp`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// One mount entry. Exactly one kind is populated per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mount {
    /// Host directory bound into the container.
    Bind(BindMount),
    /// Named engine volume.
    Volume(VolumeMount),
    /// In-memory filesystem.
    Tmpfs(TmpfsMount),
    /// Contents of another image.
    Image(ImageMount),
    /// Host device node.
    Device(DeviceMount),
}

/// Bind mount fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Path on the host.
    pub host_path: String,
    /// Path inside the container.
    pub target: String,
    /// Mount read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// Volume mount fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Name of the engine volume.
    pub volume_name: String,
    /// Path inside the container.
    pub target: String,
    /// Mount read-only.
    #[serde(default)]
    pub readonly: bool,
    /// Subdirectory of the volume to mount.
    #[serde(default)]
    pub subpath: String,
}

/// Tmpfs mount fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmpfsMount {
    /// Path inside the container.
    pub target: String,
    /// Size limit in bytes; zero means unlimited.
    #[serde(default)]
    pub size: i64,
    /// Octal permission mode, e.g. `1777`. Empty leaves the engine default.
    #[serde(default)]
    pub mode: String,
}

/// Image mount fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMount {
    /// Image whose filesystem is mounted.
    pub image: String,
    /// Path inside the container.
    pub target: String,
    /// Mount read-only.
    #[serde(default)]
    pub readonly: bool,
    /// Subdirectory of the image to mount.
    #[serde(default)]
    pub subpath: String,
}

/// Device mount fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMount {
    /// Device node on the host.
    pub host_path: String,
    /// Device path inside the container.
    pub target: String,
    /// Cgroup permissions, e.g. `rwm`.
    #[serde(default)]
    pub permissions: String,
    /// Optional device cgroup rule, e.g. `c 189:* rmw`.
    #[serde(default)]
    pub cgroup_rule: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_key_uses_container_port_and_protocol() {
        let port = PortSpec {
            protocol: Protocol::Udp,
            container_port: 53,
            host_port: Some(5353),
        };
        assert_eq!(port.key(), "53/udp");
    }

    #[test]
    fn env_var_displays_as_assignment() {
        assert_eq!(EnvVar::new("RUST_LOG", "debug").to_string(), "RUST_LOG=debug");
    }

    #[test]
    fn mount_deserializes_from_tagged_json() {
        let mount: Mount = serde_json::from_str(
            r#"{"type":"tmpfs","target":"/scratch","size":1048576,"mode":"1777"}"#,
        )
        .unwrap();
        assert_eq!(
            mount,
            Mount::Tmpfs(TmpfsMount {
                target: "/scratch".into(),
                size: 1_048_576,
                mode: "1777".into(),
            })
        );
    }

    #[test]
    fn run_spec_defaults_missing_sections() {
        let spec: RunSpec = serde_json::from_str(r#"{"image":"alpine"}"#).unwrap();
        assert_eq!(spec, RunSpec::new("alpine"));
        assert!(!spec.terminal.stdio);
    }

    #[test]
    fn entrypoint_script_defaults_to_non_interactive() {
        let spec: RunSpec = serde_json::from_str(
            r#"{"image":"alpine","process":{"script":{"script":"echo hi"}}}"#,
        )
        .unwrap();
        let script = spec.process.script.expect("script");
        assert_eq!(script.script, "echo hi");
        assert!(script.interpreter.is_empty());
        assert!(!script.interactive);
    }
}
