//! In-process engine double.
//!
//! [`StubEngine`] implements [`ContainerEngine`] without a daemon. Every
//! created container follows the same [`Script`]: once started it writes the
//! scripted output over a real in-memory duplex connection, closes it, and
//! exits with the scripted code. Calls are recorded so tests can assert on
//! counts and order.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, TerminalSize};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::engine::{ArchiveStream, AttachedStreams, ContainerEngine, EngineInfo, PullStream};
use crate::frame::{LogFrame, StdStream};
use crate::params::CreateParams;
use crate::pull::{PullMessage, RegistryCredentials};

/// Behaviour shared by every container the stub creates.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Report the container as having a terminal.
    pub tty: bool,
    /// Output written after start.
    pub output: Vec<LogFrame>,
    /// Copy stdin back to stdout until stdin closes, before the scripted output.
    pub echo_input: bool,
    /// Exit code reported by wait.
    pub exit_code: i64,
    /// Error reported by wait instead of an exit code.
    pub wait_error: Option<String>,
    /// Error returned by start.
    pub start_error: Option<String>,
    /// Error returned by resize.
    pub resize_error: Option<String>,
    /// Keep running after the output connection closes, until stopped.
    pub linger: bool,
}

/// A file archive received through [`ContainerEngine::upload_archive`].
#[derive(Debug, Clone)]
pub struct Upload {
    /// Target container.
    pub id: ContainerId,
    /// Extraction directory.
    pub destination: String,
    /// Raw tar bytes.
    pub archive: Vec<u8>,
}

struct Container {
    started: watch::Sender<bool>,
    exited: watch::Sender<bool>,
    attached: bool,
}

/// Observations that outlive the container itself.
#[derive(Default)]
struct Traces {
    stdin: Arc<Mutex<Vec<u8>>>,
    input_shutdowns: Arc<AtomicUsize>,
}

#[derive(Default)]
struct State {
    calls: Vec<&'static str>,
    next_id: usize,
    containers: HashMap<String, Container>,
    traces: HashMap<String, Traces>,
    created: Vec<CreateParams>,
    local_images: HashSet<String>,
    pull_records: Vec<PullMessage>,
    pulls: Vec<(String, Option<RegistryCredentials>)>,
    uploads: Vec<Upload>,
    volumes: HashSet<String>,
    resizes: Vec<TerminalSize>,
    signals: Vec<String>,
}

/// Engine double recording every call.
pub struct StubEngine {
    script: Script,
    state: Mutex<State>,
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new(Script::default())
    }
}

impl StubEngine {
    /// Creates a stub running `script` in every container.
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            script,
            state: Mutex::new(State::default()),
        }
    }

    /// Marks an image reference as present locally.
    #[must_use]
    pub fn with_local_image(self, reference: impl Into<String>) -> Self {
        let _ = self.lock().local_images.insert(reference.into());
        self
    }

    /// Sets the records every pull answers with.
    #[must_use]
    pub fn with_pull_records(self, records: Vec<PullMessage>) -> Self {
        self.lock().pull_records = records;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record(&self, call: &'static str) -> MutexGuard<'_, State> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    /// How many times `call` was made.
    #[must_use]
    pub fn count(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Parameters of every create call.
    #[must_use]
    pub fn created(&self) -> Vec<CreateParams> {
        self.lock().created.clone()
    }

    /// References pulled, with the credentials sent.
    #[must_use]
    pub fn pulls(&self) -> Vec<(String, Option<RegistryCredentials>)> {
        self.lock().pulls.clone()
    }

    /// Archives uploaded so far.
    #[must_use]
    pub fn uploads(&self) -> Vec<Upload> {
        self.lock().uploads.clone()
    }

    /// Terminal sizes requested so far.
    #[must_use]
    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.lock().resizes.clone()
    }

    /// Signals sent so far.
    #[must_use]
    pub fn signals(&self) -> Vec<String> {
        self.lock().signals.clone()
    }

    /// Whether a volume currently exists.
    #[must_use]
    pub fn has_volume(&self, name: &str) -> bool {
        self.lock().volumes.contains(name)
    }

    /// Bytes the container received on stdin.
    #[must_use]
    pub fn stdin_received(&self, id: &ContainerId) -> Vec<u8> {
        self.lock()
            .traces
            .get(id.as_str())
            .and_then(|p| p.stdin.lock().map(|b| b.clone()).ok())
            .unwrap_or_default()
    }

    /// How many times the client shut down the input half of the attach
    /// connection.
    #[must_use]
    pub fn input_shutdowns(&self, id: &ContainerId) -> usize {
        self.lock()
            .traces
            .get(id.as_str())
            .map_or(0, |p| p.input_shutdowns.load(Ordering::SeqCst))
    }

    /// Whether the container still exists.
    #[must_use]
    pub fn exists(&self, id: &ContainerId) -> bool {
        self.lock().containers.contains_key(id.as_str())
    }

    fn not_found(id: &ContainerId) -> BerthError {
        BerthError::NotFound {
            kind: "container",
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl ContainerEngine for StubEngine {
    async fn info(&self) -> Result<EngineInfo> {
        drop(self.record("info"));
        Ok(EngineInfo {
            host: "stub://engine".into(),
            client_api_version: "1.39".into(),
            server_api_version: "1.45".into(),
            engine_version: "stub".into(),
            os_type: "linux".into(),
        })
    }

    async fn create_container(&self, params: &CreateParams) -> Result<ContainerId> {
        let mut state = self.record("create_container");
        state.next_id += 1;
        let id = format!("stub-{}", state.next_id);
        state.created.push(params.clone());
        let _ = state.containers.insert(
            id.clone(),
            Container {
                started: watch::channel(false).0,
                exited: watch::channel(false).0,
                attached: false,
            },
        );
        let _ = state.traces.insert(id.clone(), Traces::default());
        Ok(ContainerId::new(id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        let state = self.record("start_container");
        let container = state.containers.get(id.as_str()).ok_or_else(|| Self::not_found(id))?;
        if let Some(message) = &self.script.start_error {
            return Err(BerthError::Engine {
                status: Some(500),
                message: message.clone(),
            });
        }
        let _ = container.started.send_replace(true);
        if !container.attached {
            let _ = container.exited.send_replace(true);
        }
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId) -> Result<()> {
        let state = self.record("stop_container");
        let container = state.containers.get(id.as_str()).ok_or_else(|| Self::not_found(id))?;
        let _ = container.exited.send_replace(true);
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<()> {
        let mut state = self.record("remove_container");
        state
            .containers
            .remove(id.as_str())
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn kill_container(&self, id: &ContainerId, signal: &str) -> Result<()> {
        let mut state = self.record("kill_container");
        if !state.containers.contains_key(id.as_str()) {
            return Err(Self::not_found(id));
        }
        state.signals.push(signal.to_string());
        Ok(())
    }

    async fn container_tty(&self, id: &ContainerId) -> Result<bool> {
        let state = self.record("inspect_container");
        if state.containers.contains_key(id.as_str()) {
            Ok(self.script.tty)
        } else {
            Err(Self::not_found(id))
        }
    }

    async fn attach_container(&self, id: &ContainerId, tty: bool) -> Result<AttachedStreams> {
        let mut state = self.record("attach_container");
        let (stdin, shutdowns) = match state.traces.get(id.as_str()) {
            Some(traces) => (Arc::clone(&traces.stdin), Arc::clone(&traces.input_shutdowns)),
            None => return Err(Self::not_found(id)),
        };
        let container = state
            .containers
            .get_mut(id.as_str())
            .ok_or_else(|| Self::not_found(id))?;
        container.attached = true;

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let mut started = container.started.subscribe();
        let exited = container.exited.clone();
        let input = CountingWriter {
            inner: client_write,
            shutdowns,
        };
        let script = self.script.clone();

        drop(tokio::spawn(async move {
            if started.wait_for(|s| *s).await.is_err() {
                return;
            }
            let encode = |frame: &LogFrame| {
                if script.tty {
                    frame.data.to_vec()
                } else {
                    frame.encode()
                }
            };
            let mut buf = vec![0_u8; 4096];
            if script.echo_input {
                while let Ok(n) = server_read.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if let Ok(mut received) = stdin.lock() {
                        received.extend_from_slice(&buf[..n]);
                    }
                    let stream = if script.tty { StdStream::Console } else { StdStream::Stdout };
                    let frame = LogFrame::new(stream, Bytes::copy_from_slice(&buf[..n]));
                    if server_write.write_all(&encode(&frame)).await.is_err() {
                        break;
                    }
                }
            } else {
                drop(tokio::spawn(async move {
                    while let Ok(n) = server_read.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if let Ok(mut received) = stdin.lock() {
                            received.extend_from_slice(&buf[..n]);
                        }
                    }
                }));
            }
            for frame in &script.output {
                if server_write.write_all(&encode(frame)).await.is_err() {
                    break;
                }
            }
            let _ = server_write.shutdown().await;
            if !script.linger {
                let _ = exited.send_replace(true);
            }
        }));

        Ok(AttachedStreams::from_raw(client_read, input, tty))
    }

    async fn resize_container(&self, id: &ContainerId, size: TerminalSize) -> Result<()> {
        let mut state = self.record("resize_container");
        if !state.containers.contains_key(id.as_str()) {
            return Err(Self::not_found(id));
        }
        state.resizes.push(size);
        match &self.script.resize_error {
            Some(message) => Err(BerthError::Engine {
                status: Some(500),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn wait_container(&self, id: &ContainerId) -> Result<i64> {
        let mut exited = {
            let state = self.record("wait_container");
            let container = state.containers.get(id.as_str()).ok_or_else(|| Self::not_found(id))?;
            container.exited.subscribe()
        };
        let wait_error = |message: String| BerthError::Wait {
            id: id.to_string(),
            message,
        };
        let _ = exited
            .wait_for(|e| *e)
            .await
            .map_err(|e| wait_error(e.to_string()))?;
        match &self.script.wait_error {
            Some(message) => Err(wait_error(message.clone())),
            None => {
                // Auto-remove: the container is gone once the wait resolves.
                let _ = self.lock().containers.remove(id.as_str());
                Ok(self.script.exit_code)
            }
        }
    }

    async fn inspect_image(&self, reference: &str) -> Result<()> {
        let state = self.record("inspect_image");
        if state.local_images.contains(reference) {
            Ok(())
        } else {
            Err(BerthError::NotFound {
                kind: "image",
                id: reference.to_string(),
            })
        }
    }

    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<RegistryCredentials>,
    ) -> Result<PullStream> {
        let mut state = self.record("pull_image");
        state.pulls.push((reference.to_string(), credentials));
        let records = state.pull_records.clone();
        Ok(Box::pin(stream::iter(records).map(Ok)))
    }

    async fn upload_archive(
        &self,
        id: &ContainerId,
        destination: &str,
        archive: ArchiveStream,
    ) -> Result<()> {
        if !self.record("upload_archive").containers.contains_key(id.as_str()) {
            return Err(Self::not_found(id));
        }
        let archive = archive
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .map_err(|e| BerthError::Engine {
                status: None,
                message: e.to_string(),
            })?;
        self.lock().uploads.push(Upload {
            id: id.clone(),
            destination: destination.to_string(),
            archive,
        });
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        let _ = self.record("create_volume").volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        if self.record("remove_volume").volumes.remove(name) {
            Ok(())
        } else {
            Err(BerthError::NotFound {
                kind: "volume",
                id: name.to_string(),
            })
        }
    }
}

/// Writer counting completed shutdowns of the wrapped writer.
struct CountingWriter<W> {
    inner: W,
    shutdowns: Arc<AtomicUsize>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let poll = Pin::new(&mut self.inner).poll_shutdown(cx);
        if poll.is_ready() {
            let _ = self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        poll
    }
}
