//! Domain primitive types used across the Berth workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque handle the engine assigns to a created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ContainerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle state of a container driven by one run call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// Container has been created but not yet started.
    Created,
    /// The start request was accepted by the engine.
    Started,
    /// Container process is running and attached.
    Running,
    /// Container process has exited.
    Exited,
    /// Container has been removed from the engine.
    Removed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Started => write!(f, "started"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Terminal dimensions requested for a streamed container.
///
/// A zero height and width means "do not resize".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows.
    pub height: u32,
    /// Number of columns.
    pub width: u32,
}

impl TerminalSize {
    /// Creates a terminal size from rows and columns.
    #[must_use]
    pub const fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    /// Returns whether a resize should be issued for these dimensions.
    #[must_use]
    pub const fn requests_resize(&self) -> bool {
        self.height != 0 || self.width != 0
    }
}

/// Terminal outcome of a streamed run.
///
/// A non-zero exit code is a successful orchestration outcome, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Exit status reported by the engine.
    pub exit_code: i64,
    /// Human-readable note for a non-zero exit.
    pub message: Option<String>,
}

impl RunResult {
    /// Builds a result from an exit code, describing non-zero statuses.
    #[must_use]
    pub fn from_exit_code(exit_code: i64) -> Self {
        let message = (exit_code != 0).then(|| format!("container exited with status {exit_code}"));
        Self { exit_code, message }
    }

    /// Returns whether the container exited successfully.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_terminal_size_requests_no_resize() {
        assert!(!TerminalSize::default().requests_resize());
        assert!(TerminalSize::new(24, 0).requests_resize());
        assert!(TerminalSize::new(0, 80).requests_resize());
    }

    #[test]
    fn run_result_only_describes_failures() {
        assert_eq!(RunResult::from_exit_code(0).message, None);
        let failed = RunResult::from_exit_code(3);
        assert!(!failed.success());
        assert_eq!(
            failed.message.as_deref(),
            Some("container exited with status 3")
        );
    }

    #[test]
    fn container_state_displays_lowercase() {
        assert_eq!(ContainerState::Removed.to_string(), "removed");
        assert_eq!(ContainerState::Created.to_string(), "created");
    }
}
