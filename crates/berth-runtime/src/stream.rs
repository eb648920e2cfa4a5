//! Attached I/O session for a running container.
//!
//! A session owns the attach connection of one container and drives three
//! concurrent tasks until the container is gone:
//!
//! - **output** copies container output to the caller's sinks, routing
//!   stderr frames to the error sink when the container has no terminal,
//! - **input** copies the caller's source into the container and then
//!   half-closes the connection exactly once,
//! - **lifecycle** starts the container, resizes its terminal, and waits
//!   for its removal.
//!
//! Copying starts as soon as the session is attached, before start, so no
//! early output is lost. Copy failures at shutdown are expected and only
//! logged; the session result comes from the lifecycle task.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, RunResult, TerminalSize};
use berth_engine::engine::{InputWriter, OutputStream};
use berth_engine::frame::StdStream;
use berth_engine::{AttachedStreams, ContainerEngine};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::lifecycle::LifecycleController;

/// Caller-owned byte source.
pub type Source = Box<dyn AsyncRead + Send + Unpin>;

/// Caller-owned byte sink.
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Where a session reads input from and writes output to.
pub struct StreamConfig {
    /// Input forwarded to the container's stdin.
    pub stdin: Source,
    /// Sink for stdout, and for everything when the container has a terminal.
    pub stdout: Sink,
    /// Sink for stderr.
    pub stderr: Sink,
    /// Requested terminal size. Zero leaves the terminal alone.
    pub terminal: TerminalSize,
}

impl StreamConfig {
    /// Creates a config over the given streams with no resize.
    pub fn new(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            terminal: TerminalSize::default(),
        }
    }

    /// Connects the session to this process's standard streams.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr())
    }

    /// Requests a terminal size once the container has started.
    #[must_use]
    pub const fn with_terminal(mut self, terminal: TerminalSize) -> Self {
        self.terminal = terminal;
        self
    }
}

impl std::fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConfig")
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

/// A reader that reports end-of-input once its token is cancelled.
///
/// The wrapped reader is never closed; a read still pending on it is simply
/// abandoned.
pub struct CancelableReader<R> {
    inner: R,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<R> CancelableReader<R> {
    /// Wraps `inner`, bound to `token`.
    pub fn new(inner: R, token: CancellationToken) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self {
            inner,
            token,
            cancelled,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CancelableReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.token.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Holds the input side of a connection and shuts it down at most once.
pub struct CloseGuard<W> {
    writer: Option<W>,
}

impl<W: AsyncWrite + Unpin> CloseGuard<W> {
    /// Guards `writer`.
    pub const fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// The writer, until the guard has been closed.
    pub const fn writer(&mut self) -> Option<&mut W> {
        self.writer.as_mut()
    }

    /// Half-closes the connection and drops the writer, which closes
    /// whatever the half-close left open. Returns whether this call did it.
    pub async fn close(&mut self) -> bool {
        let Some(mut writer) = self.writer.take() else {
            return false;
        };
        if let Err(e) = writer.shutdown().await {
            tracing::warn!(error = %e, "error closing attach connection input");
        }
        true
    }
}

/// An attached container, ready to run.
pub struct StreamSession {
    id: ContainerId,
    tty: bool,
    streams: AttachedStreams,
    config: StreamConfig,
    lifecycle: LifecycleController,
}

impl StreamSession {
    /// Inspects the container for a terminal and attaches to its I/O.
    ///
    /// # Errors
    ///
    /// Returns an `Operation` error naming `inspect` or `attach`.
    pub async fn attach(
        engine: Arc<dyn ContainerEngine>,
        id: &ContainerId,
        config: StreamConfig,
    ) -> Result<Self> {
        let tty = engine
            .container_tty(id)
            .await
            .map_err(|e| BerthError::operation("inspect", id.as_str(), e))?;
        let streams = engine
            .attach_container(id, tty)
            .await
            .map_err(|e| BerthError::operation("attach", id.as_str(), e))?;
        tracing::debug!(id = %id, tty, "attached to container");
        Ok(Self {
            id: id.clone(),
            tty,
            streams,
            config,
            lifecycle: LifecycleController::new(engine),
        })
    }

    /// Whether the container has a terminal, so output is unframed.
    #[must_use]
    pub const fn has_tty(&self) -> bool {
        self.tty
    }

    /// The attached container.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Starts the container and streams its I/O until it has been removed.
    ///
    /// # Errors
    ///
    /// Returns the lifecycle error (start or wait), or `Task` if a session
    /// task panicked. Copy errors are logged, never returned.
    pub async fn run(self) -> Result<RunResult> {
        let Self {
            id,
            tty: _,
            streams: AttachedStreams { output, input },
            config,
            lifecycle,
        } = self;
        let StreamConfig {
            stdin,
            stdout,
            stderr,
            terminal,
        } = config;

        let input_done = CancellationToken::new();
        let output_done = CancellationToken::new();
        let mut tasks: JoinSet<Result<Outcome>> = JoinSet::new();

        {
            let id = id.clone();
            let input_done = input_done.clone();
            let output_done = output_done.clone();
            let _ = tasks.spawn(async move {
                tokio::select! {
                    result = copy_output(output, stdout, stderr) => {
                        if let Err(e) = result {
                            tracing::warn!(id = %id, error = %e, "error copying container output");
                        }
                    }
                    () = output_done.cancelled() => {
                        tracing::debug!(id = %id, "output copy abandoned");
                    }
                }
                input_done.cancel();
                Ok(Outcome::Copied)
            });
        }

        {
            let id = id.clone();
            let input_done = input_done.clone();
            let _ = tasks.spawn(async move {
                copy_input(&id, CancelableReader::new(stdin, input_done), input).await;
                Ok(Outcome::Copied)
            });
        }

        {
            let id = id.clone();
            let _ = tasks.spawn(async move {
                let result = lifecycle.run_and_wait(&id, terminal).await;
                input_done.cancel();
                if result.is_err() {
                    output_done.cancel();
                }
                result.map(Outcome::Exited)
            });
        }

        let mut exit = None;
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok(Ok(Outcome::Exited(result))) => {
                    exit = Some(result);
                    continue;
                }
                Ok(Ok(Outcome::Copied)) => continue,
                Ok(Err(e)) => e,
                Err(e) => BerthError::Task {
                    message: format!("stream task for container {id}: {e}"),
                },
            };
            if first_error.is_none() {
                first_error = Some(error);
            } else {
                tracing::debug!(id = %id, error = %error, "additional stream task error");
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        exit.ok_or_else(|| BerthError::Task {
            message: format!("container {id} finished without an exit report"),
        })
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("tty", &self.tty)
            .finish_non_exhaustive()
    }
}

enum Outcome {
    Copied,
    Exited(RunResult),
}

/// Writes every output frame to its sink until the connection closes.
async fn copy_output(
    mut output: OutputStream,
    mut stdout: Sink,
    mut stderr: Sink,
) -> io::Result<()> {
    while let Some(frame) = output.next().await {
        let frame = frame?;
        let sink = match frame.stream {
            StdStream::Stderr => &mut stderr,
            StdStream::Stdout | StdStream::Stdin | StdStream::Console => &mut stdout,
        };
        sink.write_all(&frame.data).await?;
        sink.flush().await?;
    }
    Ok(())
}

async fn copy_input(id: &ContainerId, mut source: CancelableReader<Source>, input: InputWriter) {
    let mut guard = CloseGuard::new(input);
    if let Some(writer) = guard.writer() {
        match tokio::io::copy(&mut source, writer).await {
            Ok(bytes) => tracing::debug!(id = %id, bytes, "input copy finished"),
            Err(e) => tracing::warn!(id = %id, error = %e, "error copying input to container"),
        }
    }
    let _ = guard.close().await;
}

#[cfg(test)]
mod tests {
    use berth_engine::frame::LogFrame;
    use berth_engine::params::CreateParams;
    use std::time::Duration;

    use berth_engine::testing::{Script, StubEngine};
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn session(
        engine: &Arc<StubEngine>,
        config: StreamConfig,
    ) -> (ContainerId, StreamSession) {
        let id = engine
            .create_container(&CreateParams::default())
            .await
            .expect("create");
        let session = StreamSession::attach(engine.clone(), &id, config)
            .await
            .expect("attach");
        (id, session)
    }

    #[tokio::test]
    async fn cancelled_reader_reports_end_of_input() {
        let (_writer, reader) = tokio::io::duplex(8);
        let token = CancellationToken::new();
        let mut reader = CancelableReader::new(reader, token.clone());

        let read = tokio::spawn(async move {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.map(|_| buf)
        });
        token.cancel();

        let buf = read.await.expect("join").expect("read");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn close_guard_closes_once() {
        let (writer, mut peer) = tokio::io::duplex(8);
        let mut guard = CloseGuard::new(writer);

        assert!(guard.close().await);
        assert!(!guard.close().await);
        assert!(guard.writer().is_none());

        let mut buf = Vec::new();
        let _ = peer.read_to_end(&mut buf).await.expect("peer sees eof");
    }

    #[tokio::test]
    async fn stderr_frames_reach_error_sink() {
        let engine = Arc::new(StubEngine::new(Script {
            output: vec![
                LogFrame::new(StdStream::Stdout, "out\n"),
                LogFrame::new(StdStream::Stderr, "err\n"),
            ],
            ..Script::default()
        }));
        let (mut out_read, out_write) = tokio::io::duplex(1024);
        let (mut err_read, err_write) = tokio::io::duplex(1024);
        let config = StreamConfig::new(tokio::io::empty(), out_write, err_write);
        let (_id, session) = session(&engine, config).await;
        assert!(!session.has_tty());

        let result = session.run().await.expect("run");
        assert!(result.success());

        let mut out = String::new();
        let mut err = String::new();
        let _ = out_read.read_to_string(&mut out).await.expect("stdout");
        let _ = err_read.read_to_string(&mut err).await.expect("stderr");
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
    }

    #[tokio::test]
    async fn terminal_output_goes_to_stdout_only() {
        let engine = Arc::new(StubEngine::new(Script {
            tty: true,
            output: vec![LogFrame::new(StdStream::Console, "\u{1b}[1mbold\r\n")],
            ..Script::default()
        }));
        let (mut out_read, out_write) = tokio::io::duplex(1024);
        let (mut err_read, err_write) = tokio::io::duplex(1024);
        let config = StreamConfig::new(tokio::io::empty(), out_write, err_write)
            .with_terminal(TerminalSize::new(40, 120));
        let (_id, session) = session(&engine, config).await;
        assert!(session.has_tty());

        let _ = session.run().await.expect("run");

        let mut out = String::new();
        let mut err = String::new();
        let _ = out_read.read_to_string(&mut out).await.expect("stdout");
        let _ = err_read.read_to_string(&mut err).await.expect("stderr");
        assert_eq!(out, "\u{1b}[1mbold\r\n");
        assert!(err.is_empty());
        assert_eq!(engine.resizes(), vec![TerminalSize::new(40, 120)]);
    }

    #[tokio::test]
    async fn input_reaches_container_and_is_closed() {
        let engine = Arc::new(StubEngine::new(Script {
            echo_input: true,
            ..Script::default()
        }));
        let (mut out_read, out_write) = tokio::io::duplex(1024);
        let config = StreamConfig::new(&b"ping\n"[..], out_write, tokio::io::sink());
        let (id, session) = session(&engine, config).await;

        let _ = session.run().await.expect("run");

        let mut out = String::new();
        let _ = out_read.read_to_string(&mut out).await.expect("stdout");
        assert_eq!(out, "ping\n");
        assert_eq!(engine.stdin_received(&id), b"ping\n");
        assert_eq!(engine.input_shutdowns(&id), 1);
    }

    #[tokio::test]
    async fn output_end_releases_blocked_input_before_exit() {
        let engine = Arc::new(StubEngine::new(Script {
            output: vec![LogFrame::new(StdStream::Stdout, "bye\n")],
            linger: true,
            ..Script::default()
        }));
        let (_pending_input, stdin) = tokio::io::duplex(8);
        let config = StreamConfig::new(stdin, tokio::io::sink(), tokio::io::sink());
        let (id, session) = session(&engine, config).await;
        let running = tokio::spawn(session.run());

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.input_shutdowns(&id) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("input closed once output ended");
        assert!(!running.is_finished(), "wait is still pending");
        assert!(engine.exists(&id));

        engine.stop_container(&id).await.expect("stop");
        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("session ends after the wait resolves")
            .expect("join")
            .expect("run");

        assert!(result.success());
        assert_eq!(engine.input_shutdowns(&id), 1);
    }

    #[tokio::test]
    async fn start_failure_ends_session_with_error() {
        let engine = Arc::new(StubEngine::new(Script {
            start_error: Some("exec format error".into()),
            ..Script::default()
        }));
        let (_pending_input, stdin) = tokio::io::duplex(8);
        let config = StreamConfig::new(stdin, tokio::io::sink(), tokio::io::sink());
        let (_id, session) = session(&engine, config).await;

        let err = session.run().await.expect_err("start fails");
        assert!(matches!(err, BerthError::Operation { operation: "start", .. }));
    }

    #[tokio::test]
    async fn attach_to_unknown_container_fails() {
        let engine: Arc<dyn ContainerEngine> = Arc::new(StubEngine::default());
        let err = StreamSession::attach(
            engine,
            &ContainerId::new("gone"),
            StreamConfig::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink()),
        )
        .await
        .expect_err("unknown container");
        assert!(matches!(err, BerthError::Operation { operation: "inspect", .. }));
        assert!(err.is_not_found());
    }
}
