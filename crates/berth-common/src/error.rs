//! Unified error types for the Berth workspace.
//!
//! Every fallible operation in the workspace reports a [`BerthError`]. Engine
//! failures are translated into this taxonomy at the engine boundary so that
//! callers never see transport-specific error types.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// The engine client could not be constructed or the engine is unreachable.
    #[error("could not reach container engine: {message}")]
    Connection {
        /// Description of the connection failure.
        message: String,
    },

    /// The engine rejected a request.
    #[error("engine error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Engine {
        /// HTTP status reported by the engine, if any.
        status: Option<u16>,
        /// Message returned by the engine.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// An image name could not be parsed.
    #[error("could not parse image name {reference:?}: {message}")]
    Reference {
        /// The offending image name.
        reference: String,
        /// Why the name was rejected.
        message: String,
    },

    /// Pulling an image failed, either at the transport level or through an
    /// error message embedded in the pull progress stream.
    #[error("could not pull image {reference}: {message}")]
    Pull {
        /// The normalized reference being pulled.
        reference: String,
        /// The registry or engine message.
        message: String,
    },

    /// A container lifecycle call failed.
    #[error("could not {operation} container {id}: {source}")]
    Operation {
        /// Name of the failed operation (`create`, `start`, `stop`, ...).
        operation: &'static str,
        /// Container the operation targeted.
        id: String,
        /// Underlying failure.
        source: Box<BerthError>,
    },

    /// A volume call failed.
    #[error("could not {operation} volume {name}: {source}")]
    Volume {
        /// Name of the failed operation (`create` or `remove`).
        operation: &'static str,
        /// Volume the operation targeted.
        name: String,
        /// Underlying failure.
        source: Box<BerthError>,
    },

    /// Waiting for a container to be removed failed.
    #[error("error while waiting for container {id}: {message}")]
    Wait {
        /// Container being waited on.
        id: String,
        /// Message from the wait channel.
        message: String,
    },

    /// A run specification could not be translated into engine parameters.
    #[error("invalid run specification: {message}")]
    Mapping {
        /// Description of the malformed field.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// A concurrent task panicked or was cancelled before reporting.
    #[error("task failed: {message}")]
    Task {
        /// Description of the task failure.
        message: String,
    },
}

impl BerthError {
    /// Wraps an error with the lifecycle operation and container it belongs to.
    #[must_use]
    pub fn operation(operation: &'static str, id: impl Into<String>, source: Self) -> Self {
        Self::Operation {
            operation,
            id: id.into(),
            source: Box::new(source),
        }
    }

    /// Returns whether this error, or the error it wraps, is a missing resource.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Operation { source, .. } | Self::Volume { source, .. } => {
                source.is_not_found()
            }
            _ => false,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;
