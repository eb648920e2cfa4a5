//! Translation of a [`RunSpec`] into engine create parameters.
//!
//! Pure and deterministic. The scratch location of an entrypoint script is
//! an input, so the same spec and path always map the same way.
//!
//! Device mounts never become generic mount entries: the engine's mount API
//! has no device kind, so each device is passed as a device mapping plus,
//! when one is given, a device cgroup rule.

use std::collections::{BTreeMap, BTreeSet};

use berth_common::constants::{DEFAULT_INTERPRETER, SCRIPT_DIR_PREFIX, SCRIPT_FILE};
use berth_common::error::{BerthError, Result};
use berth_common::run_spec::{Mount, PortSpec, ProcessSpec, RunSpec, TmpfsMount};
use berth_engine::params::{
    CreateParams, DeviceMapping, HostParams, MountEntry, MountKind, PortBinding, RestartPolicy,
};

/// What a single [`Mount`] turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedMount {
    /// A generic mount entry.
    Mount(MountEntry),
    /// A device mapping, with its cgroup rule if one was given.
    Device {
        /// The device mapping.
        mapping: DeviceMapping,
        /// Device cgroup rule.
        cgroup_rule: Option<String>,
    },
}

/// Builds the create parameters for `spec`.
///
/// `script_path` is where the entrypoint script will be uploaded; it is only
/// read when the run spec carries one.
///
/// # Errors
///
/// Returns `Mapping` if a tmpfs mode is not an octal number, or if the run spec
/// has a script but no `script_path` was given.
pub fn create_params(spec: &RunSpec, script_path: Option<&str>) -> Result<CreateParams> {
    let stdio = spec.terminal.stdio;
    let (entrypoint, command) = process_args(&spec.process, script_path)?;
    let (restart_policy, auto_remove) = restart_policy(stdio);

    let mut mounts = Vec::new();
    let mut devices = Vec::new();
    let mut device_cgroup_rules = Vec::new();
    for mount in &spec.mounts {
        match map_mount(mount)? {
            MappedMount::Mount(entry) => mounts.push(entry),
            MappedMount::Device {
                mapping,
                cgroup_rule,
            } => {
                devices.push(mapping);
                device_cgroup_rules.extend(cgroup_rule);
            }
        }
    }

    let (exposed_ports, port_bindings) = port_maps(&spec.ports);

    Ok(CreateParams {
        name: spec.name.clone(),
        image: spec.image.clone(),
        user: spec.process.user.clone(),
        working_dir: spec.process.working_dir.clone(),
        command,
        entrypoint,
        env: spec.environment.iter().map(ToString::to_string).collect(),
        tty: spec.terminal.tty && stdio,
        attach_stdio: stdio,
        exposed_ports,
        host: HostParams {
            auto_remove,
            restart_policy,
            mounts,
            port_bindings,
            cap_add: spec.capabilities.iter().cloned().collect(),
            init: true,
            devices,
            device_cgroup_rules,
        },
    })
}

/// Upload path of an entrypoint script in the scratch directory named by
/// `token`.
#[must_use]
pub fn script_path(token: &str) -> String {
    format!("{SCRIPT_DIR_PREFIX}{token}/{SCRIPT_FILE}")
}

/// Entrypoint and command for `process`.
///
/// # Errors
///
/// Returns `Mapping` if the process has a script and `script_path` is
/// `None`.
pub fn process_args(
    process: &ProcessSpec,
    script_path: Option<&str>,
) -> Result<(Vec<String>, Vec<String>)> {
    let Some(script) = &process.script else {
        return Ok((process.entrypoint.clone(), process.command.clone()));
    };
    let path = script_path.ok_or_else(|| BerthError::Mapping {
        message: "entrypoint script has no upload path".into(),
    })?;

    let mut entrypoint = if script.interpreter.is_empty() {
        vec![DEFAULT_INTERPRETER.to_string()]
    } else {
        script.interpreter.clone()
    };
    if script.interactive {
        return Ok((entrypoint, Vec::new()));
    }
    entrypoint.push(path.to_string());
    Ok((entrypoint, process.command.clone()))
}

/// Foreground runs are removed on exit and never restarted; detached runs
/// are kept and always restarted.
#[must_use]
pub const fn restart_policy(stdio: bool) -> (RestartPolicy, bool) {
    if stdio {
        (RestartPolicy::No, true)
    } else {
        (RestartPolicy::Always, false)
    }
}

/// Maps one mount.
///
/// # Errors
///
/// Returns `Mapping` if a tmpfs mode is not an octal number.
pub fn map_mount(mount: &Mount) -> Result<MappedMount> {
    let entry = match mount {
        Mount::Bind(bind) => MountEntry {
            source: Some(bind.host_path.clone()),
            target: bind.target.clone(),
            read_only: bind.readonly,
            kind: MountKind::Bind {
                create_mountpoint: true,
            },
        },
        Mount::Volume(volume) => MountEntry {
            source: Some(volume.volume_name.clone()),
            target: volume.target.clone(),
            read_only: volume.readonly,
            kind: MountKind::Volume {
                subpath: non_empty(&volume.subpath),
            },
        },
        Mount::Tmpfs(tmpfs) => MountEntry {
            source: None,
            target: tmpfs.target.clone(),
            read_only: false,
            kind: MountKind::Tmpfs {
                size_bytes: tmpfs.size,
                mode: tmpfs_mode(tmpfs)?,
            },
        },
        Mount::Image(image) => MountEntry {
            source: Some(image.image.clone()),
            target: image.target.clone(),
            read_only: image.readonly,
            kind: MountKind::Image {
                subpath: non_empty(&image.subpath),
            },
        },
        Mount::Device(device) => {
            return Ok(MappedMount::Device {
                mapping: DeviceMapping {
                    path_on_host: device.host_path.clone(),
                    path_in_container: device.target.clone(),
                    cgroup_permissions: device.permissions.clone(),
                },
                cgroup_rule: device
                    .cgroup_rule
                    .as_deref()
                    .and_then(non_empty),
            });
        }
    };
    Ok(MappedMount::Mount(entry))
}

/// Parses the octal permission mode of a tmpfs mount. An empty mode leaves
/// the engine default in place.
fn tmpfs_mode(tmpfs: &TmpfsMount) -> Result<u32> {
    if tmpfs.mode.is_empty() {
        return Ok(0);
    }
    u32::from_str_radix(&tmpfs.mode, 8).map_err(|e| BerthError::Mapping {
        message: format!(
            "tmpfs mount {}: invalid mode {:?}: {e}",
            tmpfs.target, tmpfs.mode
        ),
    })
}

/// Builds the exposed-port set and the binding map. Bindings for the same
/// port and protocol accumulate.
fn port_maps(ports: &[PortSpec]) -> (BTreeSet<String>, BTreeMap<String, Vec<PortBinding>>) {
    let mut exposed = BTreeSet::new();
    let mut bindings: BTreeMap<String, Vec<PortBinding>> = BTreeMap::new();
    for port in ports {
        let key = port.key();
        bindings.entry(key.clone()).or_default().push(PortBinding {
            host_port: port.host_port,
        });
        let _ = exposed.insert(key);
    }
    (exposed, bindings)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
