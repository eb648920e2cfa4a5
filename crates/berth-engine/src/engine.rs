//! Container engine abstraction.
//!
//! [`ContainerEngine`] is the only seam between the runtime and a concrete
//! engine. Backends translate their own failures into
//! [`BerthError`](berth_common::error::BerthError) at this boundary; a missing
//! container or image is always reported as `NotFound`.

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use berth_common::error::Result;
use berth_common::types::{ContainerId, TerminalSize};
use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;

use crate::frame::{ConsoleDecoder, FrameDecoder, LogFrame};
use crate::params::CreateParams;
use crate::pull::{PullMessage, RegistryCredentials};

/// Output half of an attached container, one tagged chunk per item.
pub type OutputStream = Pin<Box<dyn Stream<Item = io::Result<LogFrame>> + Send>>;

/// Input half of an attached container.
pub type InputWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Records of an image pull.
pub type PullStream = Pin<Box<dyn Stream<Item = Result<PullMessage>> + Send>>;

/// A tar archive streamed in chunks.
pub type ArchiveStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Both halves of an attach connection.
pub struct AttachedStreams {
    /// Container output.
    pub output: OutputStream,
    /// Container stdin. Shutting it down half-closes the connection.
    pub input: InputWriter,
}

impl AttachedStreams {
    /// Wraps a raw hijacked connection.
    ///
    /// With `tty` the reader carries unframed console bytes; otherwise it
    /// carries multiplexed stdout/stderr frames.
    pub fn from_raw<R, W>(reader: R, writer: W, tty: bool) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let output: OutputStream = if tty {
            Box::pin(FramedRead::new(reader, ConsoleDecoder))
        } else {
            Box::pin(FramedRead::new(reader, FrameDecoder))
        };
        Self {
            output,
            input: Box::pin(writer),
        }
    }
}

impl std::fmt::Debug for AttachedStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedStreams").finish_non_exhaustive()
    }
}

/// Facts about the engine and the client talking to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineInfo {
    /// Engine host the client is connected to.
    pub host: String,
    /// API version the client speaks.
    pub client_api_version: String,
    /// API version the engine reports.
    pub server_api_version: String,
    /// Engine release.
    pub engine_version: String,
    /// Engine operating system.
    pub os_type: String,
}

impl EngineInfo {
    /// Flattens the info into string pairs.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        [
            ("host", &self.host),
            ("clientApiVersion", &self.client_api_version),
            ("serverApiVersion", &self.server_api_version),
            ("engineVersion", &self.engine_version),
            ("osType", &self.os_type),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
    }
}

/// The narrow set of engine calls the runtime is built on.
///
/// Implementations must be shareable across the concurrent tasks of a
/// stream session.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Reports engine and client versions.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be reached.
    async fn info(&self) -> Result<EngineInfo>;

    /// Creates a container and returns its engine-assigned identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the parameters.
    async fn create_container(&self, params: &CreateParams) -> Result<ContainerId>;

    /// Starts a created container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started.
    async fn start_container(&self, id: &ContainerId) -> Result<()>;

    /// Stops a container using the engine's default grace period.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container.
    async fn stop_container(&self, id: &ContainerId) -> Result<()>;

    /// Removes a stopped container.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container.
    async fn remove_container(&self, id: &ContainerId) -> Result<()>;

    /// Sends a signal to the container's main process.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    async fn kill_container(&self, id: &ContainerId, signal: &str) -> Result<()>;

    /// Returns whether the container was created with a terminal.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container.
    async fn container_tty(&self, id: &ContainerId) -> Result<bool>;

    /// Attaches to stdin, stdout and stderr of a container.
    ///
    /// `tty` is the container's terminal setting as reported by
    /// [`container_tty`](Self::container_tty). It decides how the output is
    /// framed: raw console bytes with a terminal, multiplexed frames without.
    ///
    /// # Errors
    ///
    /// Returns an error if the attach connection cannot be established.
    async fn attach_container(&self, id: &ContainerId, tty: bool) -> Result<AttachedStreams>;

    /// Resizes the container's terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the resize.
    async fn resize_container(&self, id: &ContainerId, size: TerminalSize) -> Result<()>;

    /// Waits until the container has been removed and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns `Wait` if the engine reports a wait error.
    async fn wait_container(&self, id: &ContainerId) -> Result<i64>;

    /// Looks up an image by its exact reference.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the image is not present locally.
    async fn inspect_image(&self, reference: &str) -> Result<()>;

    /// Starts pulling an image, yielding the engine's progress records.
    ///
    /// Errors reported inside the records are not translated; the consumer
    /// decides what to do with them.
    ///
    /// # Errors
    ///
    /// Returns an error if the pull request itself fails.
    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<RegistryCredentials>,
    ) -> Result<PullStream>;

    /// Extracts a tar archive into the container at `destination`.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails or the archive stream errors.
    async fn upload_archive(
        &self,
        id: &ContainerId,
        destination: &str,
        archive: ArchiveStream,
    ) -> Result<()>;

    /// Creates a named volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the volume.
    async fn create_volume(&self, name: &str) -> Result<()>;

    /// Removes a named volume.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown volume.
    async fn remove_volume(&self, name: &str) -> Result<()>;
}
