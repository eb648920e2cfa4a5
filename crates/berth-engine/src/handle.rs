//! Lazily connected engine handle.
//!
//! Configuration is read and the client constructed on first use, exactly
//! once, even when several callers race for it.

use std::sync::Arc;

use berth_common::config::EngineConfig;
use berth_common::error::Result;
use tokio::sync::OnceCell;

use crate::docker::DockerEngine;
use crate::engine::ContainerEngine;

/// Where the handle gets its configuration from.
#[derive(Debug, Clone)]
enum ConfigSource {
    Environment,
    Explicit(EngineConfig),
}

struct Connected {
    config: EngineConfig,
    engine: Arc<dyn ContainerEngine>,
}

/// A container engine that is connected on first use.
pub struct EngineHandle {
    source: ConfigSource,
    connected: OnceCell<Connected>,
}

impl EngineHandle {
    /// Handle configured from the process environment on first use.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            source: ConfigSource::Environment,
            connected: OnceCell::new(),
        }
    }

    /// Handle using an explicit configuration.
    #[must_use]
    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            source: ConfigSource::Explicit(config),
            connected: OnceCell::new(),
        }
    }

    /// Handle around an already constructed engine.
    #[must_use]
    pub fn from_engine(engine: Arc<dyn ContainerEngine>, config: EngineConfig) -> Self {
        Self {
            source: ConfigSource::Explicit(config.clone()),
            connected: OnceCell::from(Connected { config, engine }),
        }
    }

    /// Returns the engine, connecting if this is the first call.
    ///
    /// # Errors
    ///
    /// Returns `Config` or `Connection` if the client cannot be constructed.
    /// A failed attempt is not cached; the next call tries again.
    pub async fn engine(&self) -> Result<Arc<dyn ContainerEngine>> {
        Ok(Arc::clone(&self.connect().await?.engine))
    }

    /// Returns the configuration the engine was constructed from.
    ///
    /// # Errors
    ///
    /// Same as [`engine`](Self::engine).
    pub async fn config(&self) -> Result<&EngineConfig> {
        Ok(&self.connect().await?.config)
    }

    async fn connect(&self) -> Result<&Connected> {
        self.connected
            .get_or_try_init(|| async {
                let config = match &self.source {
                    ConfigSource::Environment => EngineConfig::load()?,
                    ConfigSource::Explicit(config) => config.clone(),
                };
                let engine = DockerEngine::connect(&config)?;
                tracing::info!(host = %engine.host(), "container engine client created");
                Ok(Connected {
                    config,
                    engine: Arc::new(engine),
                })
            })
            .await
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("source", &self.source)
            .field("connected", &self.connected.initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use berth_common::error::BerthError;

    use super::*;

    #[tokio::test]
    async fn failed_connect_is_retried_and_reported() {
        let handle = EngineHandle::from_config(EngineConfig {
            api_version: "latest".into(),
            ..EngineConfig::default()
        });
        for _ in 0..2 {
            let err = handle.engine().await.err().expect("bad version");
            assert!(matches!(err, BerthError::Config { .. }));
        }
        assert!(!handle.connected.initialized());
    }

    #[tokio::test]
    async fn explicit_config_is_exposed_after_connect() {
        let handle = EngineHandle::from_config(EngineConfig {
            host: Some("tcp://127.0.0.1:2375".into()),
            ..EngineConfig::default()
        });
        let config = handle.config().await.expect("config");
        assert_eq!(config.host.as_deref(), Some("tcp://127.0.0.1:2375"));
    }
}
