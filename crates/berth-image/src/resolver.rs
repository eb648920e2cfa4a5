//! Resolution of an image name to a runnable reference.

use std::sync::Arc;

use berth_common::error::{BerthError, Result};
use berth_engine::ContainerEngine;

use crate::credentials::{Anonymous, CredentialStore};
use crate::pull;
use crate::reference::{self, NamedReference};

/// Turns image names into references the engine can run, pulling when the
/// image is not present locally.
pub struct ImageResolver {
    engine: Arc<dyn ContainerEngine>,
    credentials: Arc<dyn CredentialStore>,
}

impl ImageResolver {
    /// Creates a resolver that pulls anonymously.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            credentials: Arc::new(Anonymous),
        }
    }

    /// Uses `credentials` to authenticate pulls.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Resolves `name` to a canonical reference.
    ///
    /// A local image matching the parsed name is returned as-is without any
    /// pull. Otherwise the name is normalized, given the default tag if it has
    /// neither tag nor digest, and pulled.
    ///
    /// # Errors
    ///
    /// Returns `Reference` for a malformed name (before any engine call) and
    /// `Pull` if the pull fails or its stream reports an error.
    pub async fn resolve(&self, name: &str) -> Result<String> {
        tracing::debug!(name, "trying to find image");
        let local = reference::parse_any(name)?.to_string();

        match self.engine.inspect_image(&local).await {
            Ok(()) => {
                tracing::debug!(reference = %local, "found image locally");
                return Ok(local);
            }
            Err(e) => tracing::debug!(reference = %local, error = %e, "image not available locally"),
        }

        let named = NamedReference::parse_normalized(name)?.with_default_tag();
        let target = named.to_string();
        let credentials = self.credentials.lookup(named.auth_key());

        tracing::info!(reference = %target, authenticated = credentials.is_some(), "pulling image");
        let stream = self
            .engine
            .pull_image(&target, credentials)
            .await
            .map_err(|e| BerthError::Pull {
                reference: target.clone(),
                message: e.to_string(),
            })?;
        pull::drain(&target, stream).await?;

        tracing::info!(reference = %target, "image pulled");
        Ok(target)
    }
}

impl std::fmt::Debug for ImageResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageResolver").finish_non_exhaustive()
    }
}
