//! Image pull progress messages.
//!
//! An image pull answers with a stream of JSON records. Most are progress-bar
//! updates; some carry a status line; a failed pull reports its error inside
//! a record rather than through the transport.

use serde::{Deserialize, Serialize};

/// Registry credentials sent along with a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    /// Account name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Account password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Identity token in place of a password.
    #[serde(
        default,
        rename = "identitytoken",
        skip_serializing_if = "Option::is_none"
    )]
    pub identity_token: Option<String>,
    /// Registry the credentials belong to.
    #[serde(
        default,
        rename = "serveraddress",
        skip_serializing_if = "Option::is_none"
    )]
    pub server_address: Option<String>,
}

/// Byte counters of a progress-bar update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDetail {
    /// Bytes processed so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<i64>,
    /// Total bytes expected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

/// Error reported inside the pull stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error code, if the registry sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Error text.
    #[serde(default)]
    pub message: String,
}

/// One record of the pull stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullMessage {
    /// Layer or image the record refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Status line such as `Pull complete`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Free-form build-style output.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream: String,
    /// Rendered progress bar.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,
    /// Progress counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_detail: Option<ProgressDetail>,
    /// Legacy error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
}

impl PullMessage {
    /// Builds a status record.
    #[must_use]
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Self::default()
        }
    }

    /// Builds a record carrying an embedded error.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error_detail: Some(ErrorDetail {
                code: None,
                message: message.into(),
            }),
            ..Self::default()
        }
    }

    /// Returns the embedded error, preferring the structured form.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_detail
            .as_ref()
            .map(|detail| detail.message.as_str())
            .or(self.error.as_deref())
    }

    /// Whether this record is only a progress-bar update.
    #[must_use]
    pub fn is_progress(&self) -> bool {
        self.progress_detail.is_some() || !self.progress.is_empty()
    }

    /// Text worth logging, if any.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        [self.status.as_str(), self.stream.as_str()]
            .into_iter()
            .map(str::trim_end)
            .find(|text| !text.is_empty())
    }
}
