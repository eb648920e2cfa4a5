//! The host-facing runtime.
//!
//! [`ContainerRuntime`] is what an invoking host talks to: it turns run
//! specifications into containers, streams them, and tears them down. The
//! engine connection is made on the first call that needs it.

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_common::config::EngineConfig;
use berth_common::error::{BerthError, Result};
use berth_common::run_spec::{EnvVar, RunSpec};
use berth_common::types::{ContainerId, RunResult, TerminalSize};
use berth_engine::{ContainerEngine, EngineHandle};
use berth_image::{Anonymous, CredentialStore, ImageResolver};
use bytes::Bytes;
use uuid::Uuid;

use crate::lifecycle::LifecycleController;
use crate::mapping;
use crate::stream::{StreamConfig, StreamSession};
use crate::upload::FileInjector;

/// Container runtime on one engine.
pub struct ContainerRuntime {
    handle: EngineHandle,
    credentials: Arc<dyn CredentialStore>,
}

impl ContainerRuntime {
    /// A runtime configured from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_handle(EngineHandle::from_env())
    }

    /// A runtime using an explicit engine configuration.
    #[must_use]
    pub fn from_config(config: EngineConfig) -> Self {
        Self::with_handle(EngineHandle::from_config(config))
    }

    /// A runtime on an already connected engine.
    #[must_use]
    pub fn from_engine(engine: Arc<dyn ContainerEngine>, config: EngineConfig) -> Self {
        Self::with_handle(EngineHandle::from_engine(engine, config))
    }

    fn with_handle(handle: EngineHandle) -> Self {
        Self {
            handle,
            credentials: Arc::new(Anonymous),
        }
    }

    /// Uses `credentials` for image pulls.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    async fn lifecycle(&self) -> Result<LifecycleController> {
        Ok(LifecycleController::new(self.handle.engine().await?))
    }

    async fn injector(&self) -> Result<FileInjector> {
        Ok(FileInjector::new(self.handle.engine().await?))
    }

    /// Engine and client identity, for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be reached.
    pub async fn info(&self) -> Result<BTreeMap<String, String>> {
        let info = self.handle.engine().await?.info().await?;
        Ok(info.to_map())
    }

    /// Creates a container for `spec`. It is not started.
    ///
    /// An entrypoint script is uploaded into a fresh scratch directory once
    /// the container exists.
    ///
    /// # Errors
    ///
    /// Returns `Mapping` for an invalid spec, an `Operation` error naming
    /// `create`, or an upload error for the script. A container whose script
    /// failed to upload is left in place.
    pub async fn create_container(&self, spec: &RunSpec) -> Result<ContainerId> {
        let script_path = spec
            .process
            .script
            .as_ref()
            .map(|_| mapping::script_path(&Uuid::new_v4().simple().to_string()));
        let params = mapping::create_params(spec, script_path.as_deref())?;
        let id = self.lifecycle().await?.create(&params).await?;

        if let (Some(script), Some(path)) = (&spec.process.script, script_path.as_deref()) {
            let content = Bytes::from(format!("{}\n", script.script));
            self.injector().await?.upload(&id, path, content).await?;
            tracing::debug!(id = %id, path, "entrypoint script installed");
        }
        Ok(id)
    }

    /// Starts a container without attaching to it.
    ///
    /// # Errors
    ///
    /// Returns an `Operation` error naming `start`.
    pub async fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.lifecycle().await?.start(id).await
    }

    /// Attaches to a created container, starts it, and streams its I/O until
    /// it has been removed.
    ///
    /// # Errors
    ///
    /// Returns attach, start and wait failures. A non-zero exit code is
    /// returned in the result, not as an error.
    pub async fn stream_container(
        &self,
        id: &ContainerId,
        config: StreamConfig,
    ) -> Result<RunResult> {
        let engine = self.handle.engine().await?;
        StreamSession::attach(engine, id, config).await?.run().await
    }

    /// Resizes a running container's terminal.
    ///
    /// # Errors
    ///
    /// Returns an `Operation` error naming `resize`.
    pub async fn resize_container(&self, id: &ContainerId, height: u32, width: u32) -> Result<()> {
        self.lifecycle()
            .await?
            .resize(id, TerminalSize::new(height, width))
            .await
    }

    /// Stops and removes a container.
    ///
    /// # Errors
    ///
    /// Returns an `Operation` error naming `stop` or `remove`. If stop
    /// fails the container is left in place.
    pub async fn delete_container(&self, id: &ContainerId) -> Result<()> {
        self.lifecycle().await?.delete(id).await
    }

    /// Sends a signal to a container.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an unknown signal or an `Operation` error naming
    /// `kill`.
    pub async fn kill_container(&self, id: &ContainerId, signal: &str) -> Result<()> {
        self.lifecycle().await?.kill(id, signal).await
    }

    /// Resolves `name` to a locally present image, pulling it if needed.
    ///
    /// # Errors
    ///
    /// Returns `Reference` for a malformed name and `Pull` if the pull
    /// fails.
    pub async fn resolve_image(&self, name: &str) -> Result<String> {
        ImageResolver::new(self.handle.engine().await?)
            .with_credentials(Arc::clone(&self.credentials))
            .resolve(name)
            .await
    }

    /// Writes `content` to `path` inside the container.
    ///
    /// # Errors
    ///
    /// See [`FileInjector::upload`].
    pub async fn upload_file(
        &self,
        id: &ContainerId,
        path: &str,
        content: impl Into<Bytes> + Send,
    ) -> Result<()> {
        self.injector().await?.upload(id, path, content.into()).await
    }

    /// Copies the engine's TLS material into the container at the same
    /// paths, so a client inside it can reach the engine too. Does nothing
    /// when the engine is not using TLS.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a certificate file cannot be read, otherwise as
    /// [`upload_file`](Self::upload_file).
    pub async fn provision_certificates(&self, id: &ContainerId) -> Result<()> {
        let Some(tls) = self.handle.config().await?.tls() else {
            tracing::debug!(id = %id, "engine not using TLS, no certificates to provision");
            return Ok(());
        };
        let injector = self.injector().await?;
        for file in tls.files() {
            injector.upload_from_host(id, file).await?;
        }
        Ok(())
    }

    /// The `DOCKER_*` variables a process in a container needs to reach the
    /// same engine.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration cannot be loaded.
    pub async fn client_environment(&self) -> Result<Vec<EnvVar>> {
        Ok(self.handle.config().await?.client_environment())
    }

    /// Creates a named volume.
    ///
    /// # Errors
    ///
    /// Returns a `Volume` error naming `create`.
    pub async fn create_volume(&self, name: &str) -> Result<()> {
        self.handle
            .engine()
            .await?
            .create_volume(name)
            .await
            .map_err(|e| BerthError::Volume {
                operation: "create",
                name: name.to_string(),
                source: Box::new(e),
            })?;
        tracing::info!(volume = name, "volume created");
        Ok(())
    }

    /// Removes a named volume.
    ///
    /// # Errors
    ///
    /// Returns a `Volume` error naming `remove`.
    pub async fn delete_volume(&self, name: &str) -> Result<()> {
        self.handle
            .engine()
            .await?
            .remove_volume(name)
            .await
            .map_err(|e| BerthError::Volume {
                operation: "remove",
                name: name.to_string(),
                source: Box::new(e),
            })?;
        tracing::info!(volume = name, "volume removed");
        Ok(())
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::from_env()
    }
}

impl std::fmt::Debug for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRuntime")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
