//! Docker Engine API backend.
//!
//! Speaks to the engine through `bollard`. The client is configured from an
//! [`EngineConfig`]; TLS material is used whenever a certificate directory is
//! configured for a TCP host.
//!
//! Attach bypasses `bollard`: its decoder assumes multiplexed frames, which
//! garbles terminal output. The connection is opened through
//! [`Endpoint`](crate::upgrade::Endpoint) and framed by the caller's terminal
//! setting instead.

use std::collections::HashMap;

use async_trait::async_trait;
use berth_common::config::EngineConfig;
use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, TerminalSize};
use bollard::auth::DockerCredentials;
use bollard::errors::Error as BollardError;
use bollard::models;
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    InspectContainerOptions, KillContainerOptionsBuilder, RemoveContainerOptions,
    RemoveVolumeOptions, ResizeContainerTTYOptionsBuilder, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptionsBuilder, WaitContainerOptionsBuilder,
};
use bollard::{ClientVersion, Docker};
use futures::StreamExt;

use crate::engine::{ArchiveStream, AttachedStreams, ContainerEngine, EngineInfo, PullStream};
use crate::params::{CreateParams, HostParams, MountEntry, MountKind, RestartPolicy};
use crate::pull::{ErrorDetail, ProgressDetail, PullMessage, RegistryCredentials};
use crate::upgrade::Endpoint;

/// Host used when none is configured.
#[cfg(unix)]
pub const DEFAULT_HOST: &str = "unix:///var/run/docker.sock";
/// Host used when none is configured.
#[cfg(windows)]
pub const DEFAULT_HOST: &str = "npipe:////./pipe/docker_engine";

/// Request timeout in seconds. Attach and wait calls last as long as the
/// container does, so this is effectively unbounded.
const REQUEST_TIMEOUT_SECS: u64 = 60 * 60 * 24 * 365 * 100;

/// Attach query: every stream, including output produced before attach.
const ATTACH_QUERY: &str = "stream=1&logs=1&stdin=1&stdout=1&stderr=1";

/// Wait condition that resolves once the container is gone.
const WAIT_CONDITION: &str = berth_common::constants::WAIT_CONDITION_REMOVED;

/// Container engine backed by the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
    host: String,
    api_version: String,
    endpoint: Endpoint,
}

impl DockerEngine {
    /// Builds a client from configuration. No request is sent.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a malformed API version and `Connection` if the
    /// client cannot be constructed (for example, unreadable TLS files).
    pub fn connect(config: &EngineConfig) -> Result<Self> {
        let (major_version, minor_version) = config.api_version_parts()?;
        let version = ClientVersion {
            major_version,
            minor_version,
        };
        let host = config
            .host
            .clone()
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let docker = if host.starts_with("unix://") || host.starts_with("npipe://") {
            Docker::connect_with_socket(&host, REQUEST_TIMEOUT_SECS, &version)
        } else if let Some(tls) = config.tls() {
            Docker::connect_with_ssl(
                &host,
                &tls.key,
                &tls.cert,
                &tls.ca,
                REQUEST_TIMEOUT_SECS,
                &version,
            )
        } else {
            Docker::connect_with_http(&host, REQUEST_TIMEOUT_SECS, &version)
        }
        .map_err(|e| BerthError::Connection {
            message: format!("{host}: {e}"),
        })?;

        tracing::debug!(host = %host, api_version = %config.api_version, "docker client configured");
        let tls = if host.starts_with("unix://") || host.starts_with("npipe://") {
            None
        } else {
            config.tls()
        };
        Ok(Self {
            docker,
            endpoint: Endpoint::new(host.clone(), tls),
            host,
            api_version: config.api_version.clone(),
        })
    }

    /// Engine host this client talks to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn info(&self) -> Result<EngineInfo> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| engine_error(e, "engine", &self.host))?;
        let client = self.docker.client_version();
        Ok(EngineInfo {
            host: self.host.clone(),
            client_api_version: format!("{}.{}", client.major_version, client.minor_version),
            server_api_version: version.api_version.unwrap_or_default(),
            engine_version: version.version.unwrap_or_default(),
            os_type: version.os.unwrap_or_default(),
        })
    }

    async fn create_container(&self, params: &CreateParams) -> Result<ContainerId> {
        let options = params
            .name
            .as_deref()
            .map(|name| CreateContainerOptionsBuilder::new().name(name).build());
        let label = params.name.as_deref().unwrap_or(&params.image);
        let response = self
            .docker
            .create_container(options, container_body(params))
            .await
            .map_err(|e| engine_error(e, "image", label))?;
        for warning in &response.warnings {
            tracing::warn!(id = %response.id, warning = %warning, "engine warning on create");
        }
        Ok(ContainerId::new(response.id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions>)
            .await
            .map_err(|e| engine_error(e, "container", id.as_str()))
    }

    async fn stop_container(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .stop_container(id.as_str(), None::<StopContainerOptions>)
            .await
            .map_err(|e| engine_error(e, "container", id.as_str()))
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .remove_container(id.as_str(), None::<RemoveContainerOptions>)
            .await
            .map_err(|e| engine_error(e, "container", id.as_str()))
    }

    async fn kill_container(&self, id: &ContainerId, signal: &str) -> Result<()> {
        let options = KillContainerOptionsBuilder::new().signal(signal).build();
        self.docker
            .kill_container(id.as_str(), Some(options))
            .await
            .map_err(|e| engine_error(e, "container", id.as_str()))
    }

    async fn container_tty(&self, id: &ContainerId) -> Result<bool> {
        let inspect = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| engine_error(e, "container", id.as_str()))?;
        Ok(inspect
            .config
            .and_then(|config| config.tty)
            .unwrap_or(false))
    }

    async fn attach_container(&self, id: &ContainerId, tty: bool) -> Result<AttachedStreams> {
        let path = format!(
            "/v{}/containers/{}/attach?{ATTACH_QUERY}",
            self.api_version,
            id.as_str()
        );
        let raw = self.endpoint.upgrade(&path, id.as_str()).await?;
        tracing::debug!(id = %id, tty, "attach connection switched to raw stream");
        let (reader, writer) = tokio::io::split(raw);
        Ok(AttachedStreams::from_raw(reader, writer, tty))
    }

    async fn resize_container(&self, id: &ContainerId, size: TerminalSize) -> Result<()> {
        let height = i32::try_from(size.height).map_err(|_| BerthError::Mapping {
            message: format!("terminal height {} out of range", size.height),
        })?;
        let width = i32::try_from(size.width).map_err(|_| BerthError::Mapping {
            message: format!("terminal width {} out of range", size.width),
        })?;
        let options = ResizeContainerTTYOptionsBuilder::new()
            .h(height)
            .w(width)
            .build();
        self.docker
            .resize_container_tty(id.as_str(), options)
            .await
            .map_err(|e| engine_error(e, "container", id.as_str()))
    }

    async fn wait_container(&self, id: &ContainerId) -> Result<i64> {
        let options = WaitContainerOptionsBuilder::new()
            .condition(WAIT_CONDITION)
            .build();
        let mut stream = self.docker.wait_container(id.as_str(), Some(options));
        match stream.next().await {
            Some(Ok(response)) => {
                let message = response
                    .error
                    .and_then(|error| error.message)
                    .filter(|message| !message.is_empty());
                match message {
                    Some(message) => Err(BerthError::Wait {
                        id: id.to_string(),
                        message,
                    }),
                    None => Ok(response.status_code),
                }
            }
            // A non-zero exit arrives as an error carrying the status code.
            Some(Err(BollardError::DockerContainerWaitError { error, code })) => {
                if error.is_empty() {
                    Ok(code)
                } else {
                    Err(BerthError::Wait {
                        id: id.to_string(),
                        message: error,
                    })
                }
            }
            Some(Err(e)) => Err(engine_error(e, "container", id.as_str())),
            None => Err(BerthError::Wait {
                id: id.to_string(),
                message: "wait ended without a status".into(),
            }),
        }
    }

    async fn inspect_image(&self, reference: &str) -> Result<()> {
        let _ = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(|e| engine_error(e, "image", reference))?;
        Ok(())
    }

    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<RegistryCredentials>,
    ) -> Result<PullStream> {
        let options = CreateImageOptionsBuilder::new()
            .from_image(reference)
            .build();
        let credentials = credentials.map(docker_credentials);
        let reference = reference.to_string();
        let stream = self
            .docker
            .create_image(Some(options), None, credentials)
            .map(move |item| match item {
                Ok(info) => Ok(pull_message(info)),
                // Errors the engine embeds in the stream stay in-band.
                Err(BollardError::DockerStreamError { error }) => Ok(PullMessage::failure(error)),
                Err(e) => Err(engine_error(e, "image", &reference)),
            });
        Ok(Box::pin(stream))
    }

    async fn upload_archive(
        &self,
        id: &ContainerId,
        destination: &str,
        archive: ArchiveStream,
    ) -> Result<()> {
        let options = UploadToContainerOptionsBuilder::new()
            .path(destination)
            .build();
        self.docker
            .upload_to_container(
                id.as_str(),
                Some(options),
                bollard::body_try_stream(archive),
            )
            .await
            .map_err(|e| engine_error(e, "container", id.as_str()))
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        let options = models::VolumeCreateOptions {
            name: Some(name.to_string()),
            ..Default::default()
        };
        let _ = self
            .docker
            .create_volume(options)
            .await
            .map_err(|e| engine_error(e, "volume", name))?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(|e| engine_error(e, "volume", name))
    }
}

/// Translates a `bollard` failure into the workspace taxonomy.
fn engine_error(err: BollardError, kind: &'static str, id: &str) -> BerthError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => BerthError::NotFound {
            kind,
            id: id.to_string(),
        },
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => BerthError::Engine {
            status: Some(status_code),
            message,
        },
        BollardError::IOError { .. } | BollardError::HyperResponseError { .. } => {
            BerthError::Connection {
                message: err.to_string(),
            }
        }
        other => BerthError::Engine {
            status: None,
            message: other.to_string(),
        },
    }
}

fn pull_message(info: models::CreateImageInfo) -> PullMessage {
    PullMessage {
        id: info.id,
        status: info.status.unwrap_or_default(),
        stream: String::new(),
        progress: info.progress.unwrap_or_default(),
        progress_detail: info.progress_detail.map(|detail| ProgressDetail {
            current: detail.current,
            total: detail.total,
        }),
        error: None,
        error_detail: info.error_detail.map(|detail| ErrorDetail {
            code: detail.code,
            message: detail.message.unwrap_or_default(),
        }),
    }
}

fn docker_credentials(credentials: RegistryCredentials) -> DockerCredentials {
    DockerCredentials {
        username: credentials.username,
        password: credentials.password,
        identitytoken: credentials.identity_token,
        serveraddress: credentials.server_address,
        ..Default::default()
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn non_empty_list(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

/// Builds the create request body.
fn container_body(params: &CreateParams) -> models::ContainerCreateBody {
    let stdio = Some(params.attach_stdio);
    let exposed_ports: HashMap<String, HashMap<(), ()>> = params
        .exposed_ports
        .iter()
        .map(|port| (port.clone(), HashMap::new()))
        .collect();

    models::ContainerCreateBody {
        image: Some(params.image.clone()),
        user: non_empty(&params.user),
        working_dir: non_empty(&params.working_dir),
        cmd: non_empty_list(&params.command),
        entrypoint: non_empty_list(&params.entrypoint),
        env: Some(params.env.clone()),
        tty: Some(params.tty),
        attach_stdin: stdio,
        attach_stdout: stdio,
        attach_stderr: stdio,
        open_stdin: stdio,
        stdin_once: stdio,
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config(&params.host)),
        ..Default::default()
    }
}

fn host_config(host: &HostParams) -> models::HostConfig {
    let port_bindings = host
        .port_bindings
        .iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .iter()
                .map(|binding| models::PortBinding {
                    host_ip: None,
                    host_port: binding.host_port.map(|p| p.to_string()),
                })
                .collect();
            (port.clone(), Some(bindings))
        })
        .collect();
    let devices = host
        .devices
        .iter()
        .map(|device| models::DeviceMapping {
            path_on_host: Some(device.path_on_host.clone()),
            path_in_container: Some(device.path_in_container.clone()),
            cgroup_permissions: Some(device.cgroup_permissions.clone()),
        })
        .collect();
    let restart = match host.restart_policy {
        RestartPolicy::No => models::RestartPolicyNameEnum::NO,
        RestartPolicy::Always => models::RestartPolicyNameEnum::ALWAYS,
    };

    models::HostConfig {
        auto_remove: Some(host.auto_remove),
        restart_policy: Some(models::RestartPolicy {
            name: Some(restart),
            maximum_retry_count: None,
        }),
        mounts: Some(host.mounts.iter().map(mount).collect()),
        port_bindings: Some(port_bindings),
        cap_add: Some(host.cap_add.clone()),
        init: Some(host.init),
        devices: Some(devices),
        device_cgroup_rules: Some(host.device_cgroup_rules.clone()),
        ..Default::default()
    }
}

fn mount(entry: &MountEntry) -> models::Mount {
    let base = models::Mount {
        target: Some(entry.target.clone()),
        source: entry.source.clone(),
        read_only: Some(entry.read_only),
        ..Default::default()
    };
    match &entry.kind {
        MountKind::Bind { create_mountpoint } => models::Mount {
            typ: Some(models::MountTypeEnum::BIND),
            bind_options: Some(models::MountBindOptions {
                create_mountpoint: Some(*create_mountpoint),
                ..Default::default()
            }),
            ..base
        },
        MountKind::Volume { subpath } => models::Mount {
            typ: Some(models::MountTypeEnum::VOLUME),
            volume_options: Some(models::MountVolumeOptions {
                subpath: subpath.clone(),
                ..Default::default()
            }),
            ..base
        },
        MountKind::Tmpfs { size_bytes, mode } => models::Mount {
            typ: Some(models::MountTypeEnum::TMPFS),
            tmpfs_options: Some(models::MountTmpfsOptions {
                size_bytes: Some(*size_bytes),
                mode: Some(i64::from(*mode)),
                ..Default::default()
            }),
            ..base
        },
        MountKind::Image { subpath } => models::Mount {
            typ: Some(models::MountTypeEnum::IMAGE),
            image_options: Some(models::MountImageOptions {
                subpath: subpath.clone(),
                ..Default::default()
            }),
            ..base
        },
    }
}
