//! Engine connection settings.
//!
//! Settings come either from a JSON file named by
//! [`ENV_CONFIG_PATH`](crate::constants::ENV_CONFIG_PATH) or from the standard
//! `DOCKER_*` environment variables. They are read once, when the runtime
//! first needs an engine client.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{
    CA_FILE, CERT_FILE, DEFAULT_API_VERSION, ENV_API_VERSION, ENV_CERT_PATH, ENV_CONFIG_PATH,
    ENV_HOST, ENV_TLS_VERIFY, KEY_FILE,
};
use crate::error::{BerthError, Result};
use crate::run_spec::EnvVar;

/// How to reach the container engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine address (`unix:///var/run/docker.sock`, `tcp://host:2376`).
    /// `None` uses the platform default socket.
    #[serde(default)]
    pub host: Option<String>,
    /// Engine API version, e.g. `1.39`.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Directory containing `ca.pem`, `cert.pem` and `key.pem`. Always
    /// absolute once loaded.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: None,
            api_version: default_api_version(),
            cert_path: None,
        }
    }
}

/// Makes a cert directory absolute, joining a relative one onto `base` or the
/// working directory.
fn absolute_cert_path(path: &Path, base: Option<&Path>) -> Result<PathBuf> {
    let joined = match base {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    };
    std::path::absolute(&joined).map_err(|e| BerthError::Config {
        message: format!("cert path {}: {e}", path.display()),
    })
}

/// Paths of the TLS files used to authenticate against the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    /// CA certificate.
    pub ca: PathBuf,
    /// Client certificate.
    pub cert: PathBuf,
    /// Client private key.
    pub key: PathBuf,
}

impl TlsMaterial {
    /// Returns the standard file layout inside a cert directory.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ca: dir.join(CA_FILE),
            cert: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
        }
    }

    /// Returns all three paths in upload order.
    #[must_use]
    pub fn files(&self) -> [&Path; 3] {
        [&self.ca, &self.cert, &self.key]
    }
}

impl EngineConfig {
    /// Loads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is named but cannot be read
    /// or parsed.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Loads the configuration using `lookup` to read variables.
    ///
    /// A configuration file, when named, replaces the environment entirely.
    /// A relative `DOCKER_CERT_PATH` is resolved against the working
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is named but cannot be read
    /// or parsed, or if the cert path cannot be made absolute.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(path) = non_empty(ENV_CONFIG_PATH) {
            return Self::from_file(Path::new(&path));
        }

        let config = Self {
            host: non_empty(ENV_HOST),
            api_version: non_empty(ENV_API_VERSION).unwrap_or_else(default_api_version),
            cert_path: non_empty(ENV_CERT_PATH)
                .map(|path| absolute_cert_path(Path::new(&path), None))
                .transpose()?,
        };
        tracing::debug!(host = ?config.host, api_version = %config.api_version, "engine config from environment");
        Ok(config)
    }

    /// Reads a JSON configuration file. A relative `cert_path` is resolved
    /// against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BerthError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config: Self = serde_json::from_str(&content)?;
        config.cert_path = config
            .cert_path
            .map(|cert_path| absolute_cert_path(&cert_path, path.parent()))
            .transpose()?;
        tracing::debug!(path = %path.display(), "engine config from file");
        Ok(config)
    }

    /// Returns the TLS material if a cert directory is configured.
    #[must_use]
    pub fn tls(&self) -> Option<TlsMaterial> {
        self.cert_path.as_deref().map(TlsMaterial::in_dir)
    }

    /// Parses the configured API version into `(major, minor)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the version is not of the form `major.minor`.
    pub fn api_version_parts(&self) -> Result<(usize, usize)> {
        let invalid = || BerthError::Config {
            message: format!("invalid API version: {}", self.api_version),
        };
        let (major, minor) = self.api_version.split_once('.').ok_or_else(invalid)?;
        Ok((
            major.parse().map_err(|_| invalid())?,
            minor.parse().map_err(|_| invalid())?,
        ))
    }

    /// Environment a process inside a container needs to reach this engine.
    #[must_use]
    pub fn client_environment(&self) -> Vec<EnvVar> {
        let mut env = vec![EnvVar::new(ENV_API_VERSION, &self.api_version)];
        if let Some(host) = &self.host {
            env.push(EnvVar::new(ENV_HOST, host));
        }
        if let Some(cert_path) = &self.cert_path {
            env.push(EnvVar::new(ENV_CERT_PATH, cert_path.to_string_lossy()));
            env.push(EnvVar::new(ENV_TLS_VERIFY, "1"));
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = EngineConfig::load_with(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.api_version, "1.39");
        assert!(config.tls().is_none());
    }

    #[test]
    fn environment_overrides_host_version_and_certs() {
        let config = EngineConfig::load_with(lookup(&[
            ("DOCKER_HOST", "tcp://10.0.0.2:2376"),
            ("DOCKER_API_VERSION", "1.43"),
            ("DOCKER_CERT_PATH", "/etc/docker/certs"),
        ]))
        .unwrap();
        assert_eq!(config.host.as_deref(), Some("tcp://10.0.0.2:2376"));
        assert_eq!(config.api_version_parts().unwrap(), (1, 43));
        let tls = config.tls().unwrap();
        assert_eq!(tls.key, PathBuf::from("/etc/docker/certs/key.pem"));
    }

    #[test]
    fn empty_variables_are_ignored() {
        let config = EngineConfig::load_with(lookup(&[("DOCKER_API_VERSION", "")])).unwrap();
        assert_eq!(config.api_version, "1.39");
    }

    #[test]
    fn config_file_replaces_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"host":"unix:///run/podman.sock"}"#).expect("write");

        let config = EngineConfig::load_with(lookup(&[
            ("BERTH_DOCKER_CONFIG", path.to_str().unwrap()),
            ("DOCKER_HOST", "tcp://ignored:2375"),
        ]))
        .unwrap();
        assert_eq!(config.host.as_deref(), Some("unix:///run/podman.sock"));
        assert_eq!(config.api_version, "1.39");
    }

    #[test]
    fn missing_config_file_is_an_io_error() {
        let err = EngineConfig::from_file(Path::new("/nonexistent/engine.json")).unwrap_err();
        assert!(matches!(err, BerthError::Io { .. }));
    }

    #[test]
    fn malformed_api_version_is_rejected() {
        let config = EngineConfig {
            api_version: "v2".into(),
            ..EngineConfig::default()
        };
        assert!(config.api_version_parts().is_err());
    }

    #[test]
    fn client_environment_includes_tls_verify_with_certs() {
        let config = EngineConfig {
            host: Some("tcp://engine:2376".into()),
            api_version: "1.41".into(),
            cert_path: Some(PathBuf::from("/certs")),
        };
        let env: Vec<String> = config
            .client_environment()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            env,
            vec![
                "DOCKER_API_VERSION=1.41",
                "DOCKER_HOST=tcp://engine:2376",
                "DOCKER_CERT_PATH=/certs",
                "DOCKER_TLS_VERIFY=1",
            ]
        );
    }

    #[test]
    fn relative_cert_path_from_environment_is_made_absolute() {
        let config =
            EngineConfig::load_with(lookup(&[("DOCKER_CERT_PATH", "certs/engine")])).unwrap();

        let cert_path = config.cert_path.clone().unwrap();
        assert!(cert_path.is_absolute());
        assert_eq!(
            cert_path,
            std::env::current_dir().unwrap().join("certs/engine")
        );
        assert_eq!(config.tls().unwrap().ca, cert_path.join("ca.pem"));
        let exported = cert_path.to_string_lossy().into_owned();
        assert!(
            config
                .client_environment()
                .contains(&EnvVar::new("DOCKER_CERT_PATH", exported))
        );
    }

    #[test]
    fn relative_cert_path_in_file_is_resolved_next_to_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"cert_path":"tls"}"#).expect("write");

        let config = EngineConfig::from_file(&path).unwrap();

        let expected = std::path::absolute(dir.path().join("tls")).unwrap();
        assert_eq!(config.cert_path, Some(expected));
    }
}
