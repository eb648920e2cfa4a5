//! Container lifecycle: create, start, wait, stop and remove.
//!
//! Every engine failure is wrapped with the name of the operation that
//! failed. Nothing here retries.

use std::sync::Arc;

use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, ContainerState, RunResult, TerminalSize};
use berth_engine::ContainerEngine;
use berth_engine::params::CreateParams;

/// Signal names accepted by [`LifecycleController::kill`], without the
/// `SIG` prefix.
const SIGNALS: &[&str] = &[
    "ABRT", "ALRM", "BUS", "CHLD", "CONT", "FPE", "HUP", "ILL", "INT", "IO", "KILL", "PIPE",
    "PROF", "PWR", "QUIT", "SEGV", "STKFLT", "STOP", "SYS", "TERM", "TRAP", "TSTP", "TTIN",
    "TTOU", "URG", "USR1", "USR2", "VTALRM", "WINCH", "XCPU", "XFSZ",
];

/// Drives state transitions of containers on one engine.
#[derive(Clone)]
pub struct LifecycleController {
    engine: Arc<dyn ContainerEngine>,
}

impl LifecycleController {
    /// Creates a controller over `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Creates a container.
    ///
    /// # Errors
    ///
    /// Returns an `Operation` error naming `create` if the engine is
    /// unreachable or rejects the parameters. No container is left behind.
    pub async fn create(&self, params: &CreateParams) -> Result<ContainerId> {
        let label = params.name.as_deref().unwrap_or(&params.image);
        let id = self
            .engine
            .create_container(params)
            .await
            .map_err(|e| BerthError::operation("create", label, e))?;
        tracing::info!(id = %id, image = %params.image, state = %ContainerState::Created, "container created");
        Ok(id)
    }

    /// Starts a created container.
    ///
    /// # Errors
    ///
    /// Returns an `Operation` error naming `start`.
    pub async fn start(&self, id: &ContainerId) -> Result<()> {
        self.engine
            .start_container(id)
            .await
            .map_err(|e| BerthError::operation("start", id.as_str(), e))?;
        tracing::info!(id = %id, state = %ContainerState::Started, "container started");
        Ok(())
    }

    /// Resizes the container's terminal.
    ///
    /// # Errors
    ///
    /// Returns an `Operation` error naming `resize`.
    pub async fn resize(&self, id: &ContainerId, size: TerminalSize) -> Result<()> {
        self.engine
            .resize_container(id, size)
            .await
            .map_err(|e| BerthError::operation("resize", id.as_str(), e))
    }

    /// Waits for the container to be removed and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns `Wait` if the engine's wait channel reports an error. A
    /// non-zero exit code is not an error.
    pub async fn wait(&self, id: &ContainerId) -> Result<RunResult> {
        let exit_code = self.engine.wait_container(id).await.map_err(|e| match e {
            BerthError::Wait { .. } => e,
            other => BerthError::operation("wait", id.as_str(), other),
        })?;
        tracing::info!(id = %id, exit_code, state = %ContainerState::Removed, "container exited");
        Ok(RunResult::from_exit_code(exit_code))
    }

    /// Starts the container, resizes its terminal if `size` asks for it, and
    /// waits for removal.
    ///
    /// The wait is registered before start so a fast container with
    /// auto-remove cannot be missed. A failed resize is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns the start error or the wait error.
    pub async fn run_and_wait(&self, id: &ContainerId, size: TerminalSize) -> Result<RunResult> {
        let waiter = {
            let controller = self.clone();
            let id = id.clone();
            tokio::spawn(async move { controller.wait(&id).await })
        };
        tokio::task::yield_now().await;

        if let Err(e) = self.start(id).await {
            waiter.abort();
            return Err(e);
        }

        if size.requests_resize() {
            if let Err(e) = self.resize(id, size).await {
                tracing::warn!(id = %id, height = size.height, width = size.width, error = %e, "error during resize");
            }
        }

        waiter.await.map_err(|e| BerthError::Task {
            message: format!("wait for container {id}: {e}"),
        })?
    }

    /// Stops the container and then removes it.
    ///
    /// Remove is only attempted if stop succeeded.
    ///
    /// # Errors
    ///
    /// Returns an `Operation` error naming `stop` or `remove`.
    pub async fn delete(&self, id: &ContainerId) -> Result<()> {
        self.engine
            .stop_container(id)
            .await
            .map_err(|e| BerthError::operation("stop", id.as_str(), e))?;
        tracing::debug!(id = %id, "container stopped");

        self.engine
            .remove_container(id)
            .await
            .map_err(|e| BerthError::operation("remove", id.as_str(), e))?;
        tracing::info!(id = %id, state = %ContainerState::Removed, "container removed");
        Ok(())
    }

    /// Sends a signal to the container's main process.
    ///
    /// `signal` is a name such as `TERM` or `SIGTERM` (any case) or a
    /// signal number.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an unknown signal and an `Operation` error
    /// naming `kill` if delivery fails.
    pub async fn kill(&self, id: &ContainerId, signal: &str) -> Result<()> {
        let signal = normalize_signal(signal)?;
        self.engine
            .kill_container(id, &signal)
            .await
            .map_err(|e| BerthError::operation("kill", id.as_str(), e))?;
        tracing::info!(id = %id, signal = %signal, "signal sent");
        Ok(())
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController").finish_non_exhaustive()
    }
}

/// Turns `term`, `TERM`, `SIGTERM` into `SIGTERM`; numbers pass through.
fn normalize_signal(signal: &str) -> Result<String> {
    if !signal.is_empty() && signal.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(signal.to_string());
    }
    let upper = signal.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    if SIGNALS.contains(&name) {
        Ok(format!("SIG{name}"))
    } else {
        Err(BerthError::Config {
            message: format!("unknown signal {signal:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use berth_engine::testing::{Script, StubEngine};

    use super::*;

    fn controller(script: Script) -> (Arc<StubEngine>, LifecycleController) {
        let engine = Arc::new(StubEngine::new(script));
        (engine.clone(), LifecycleController::new(engine))
    }

    #[test]
    fn signals_are_normalized() {
        assert_eq!(normalize_signal("term").expect("term"), "SIGTERM");
        assert_eq!(normalize_signal("SIGKILL").expect("kill"), "SIGKILL");
        assert_eq!(normalize_signal("9").expect("number"), "9");
        assert!(normalize_signal("SIGNOPE").is_err());
        assert!(normalize_signal("").is_err());
    }

    #[tokio::test]
    async fn delete_unknown_container_never_removes() {
        let (engine, lifecycle) = controller(Script::default());

        let err = lifecycle
            .delete(&ContainerId::new("missing"))
            .await
            .expect_err("stop fails");

        assert!(matches!(err, BerthError::Operation { operation: "stop", .. }));
        assert!(err.is_not_found());
        assert_eq!(engine.count("stop_container"), 1);
        assert_eq!(engine.count("remove_container"), 0);
    }

    #[tokio::test]
    async fn delete_stops_then_removes() {
        let (engine, lifecycle) = controller(Script::default());
        let id = lifecycle
            .create(&CreateParams::default())
            .await
            .expect("create");

        lifecycle.delete(&id).await.expect("delete");

        assert_eq!(
            engine.calls(),
            vec!["create_container", "stop_container", "remove_container"]
        );
        assert!(!engine.exists(&id));
    }

    #[tokio::test]
    async fn run_and_wait_reports_nonzero_exit_as_result() {
        let (engine, lifecycle) = controller(Script {
            exit_code: 3,
            ..Script::default()
        });
        let id = lifecycle
            .create(&CreateParams::default())
            .await
            .expect("create");

        let result = lifecycle
            .run_and_wait(&id, TerminalSize::default())
            .await
            .expect("run");

        assert_eq!(result.exit_code, 3);
        assert!(result.message.is_some());
        assert_eq!(engine.count("resize_container"), 0);
    }

    #[tokio::test]
    async fn resize_failure_is_not_fatal() {
        let (engine, lifecycle) = controller(Script {
            resize_error: Some("no tty".into()),
            ..Script::default()
        });
        let id = lifecycle
            .create(&CreateParams::default())
            .await
            .expect("create");

        let result = lifecycle
            .run_and_wait(&id, TerminalSize::new(24, 80))
            .await
            .expect("run");

        assert!(result.success());
        assert_eq!(engine.resizes(), vec![TerminalSize::new(24, 80)]);
    }

    #[tokio::test]
    async fn start_failure_is_wrapped() {
        let (_engine, lifecycle) = controller(Script {
            start_error: Some("no such image".into()),
            ..Script::default()
        });
        let id = lifecycle
            .create(&CreateParams::default())
            .await
            .expect("create");

        let err = lifecycle
            .run_and_wait(&id, TerminalSize::default())
            .await
            .expect_err("start fails");
        assert!(matches!(err, BerthError::Operation { operation: "start", .. }));
    }

    #[tokio::test]
    async fn wait_error_is_fatal() {
        let (_engine, lifecycle) = controller(Script {
            wait_error: Some("container vanished".into()),
            ..Script::default()
        });
        let id = lifecycle
            .create(&CreateParams::default())
            .await
            .expect("create");

        let err = lifecycle
            .run_and_wait(&id, TerminalSize::default())
            .await
            .expect_err("wait fails");
        assert!(matches!(err, BerthError::Wait { .. }));
    }

    #[tokio::test]
    async fn kill_forwards_normalized_signal() {
        let (engine, lifecycle) = controller(Script::default());
        let id = lifecycle
            .create(&CreateParams::default())
            .await
            .expect("create");

        lifecycle.kill(&id, "hup").await.expect("kill");

        assert_eq!(engine.signals(), vec!["SIGHUP".to_string()]);
    }
}
