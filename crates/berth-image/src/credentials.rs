//! Registry credential lookup.
//!
//! Reading credential files is somebody else's job; the resolver only needs
//! a way to ask "what credentials do I send to this registry?".

use std::collections::HashMap;

use berth_engine::pull::RegistryCredentials;

/// Source of registry credentials, keyed by registry address.
pub trait CredentialStore: Send + Sync {
    /// Returns credentials for the registry identified by `auth_key`, if any.
    ///
    /// For Docker Hub the key is the index server URL
    /// (`https://index.docker.io/v1/`); for other registries it is the
    /// registry host.
    fn lookup(&self, auth_key: &str) -> Option<RegistryCredentials>;
}

/// A store that never has credentials. Pulls go out anonymously.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl CredentialStore for Anonymous {
    fn lookup(&self, _auth_key: &str) -> Option<RegistryCredentials> {
        None
    }
}

/// An in-memory credential store.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, RegistryCredentials>,
}

impl StaticCredentials {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds credentials for a registry address. Returns the store for chaining.
    #[must_use]
    pub fn with(mut self, server: impl Into<String>, credentials: RegistryCredentials) -> Self {
        let _ = self.entries.insert(server.into(), credentials);
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn lookup(&self, auth_key: &str) -> Option<RegistryCredentials> {
        let (server, credentials) = self.entries.get_key_value(auth_key).or_else(|| {
            let wanted = hostname(auth_key);
            self.entries
                .iter()
                .find(|(server, _)| hostname(server) == wanted)
        })?;
        let mut credentials = credentials.clone();
        if credentials.server_address.is_none() {
            credentials.server_address = Some(server.clone());
        }
        Some(credentials)
    }
}

/// Reduces a registry address to its host, so `https://host/v1/` and `host`
/// match each other.
fn hostname(address: &str) -> &str {
    let stripped = address
        .strip_prefix("https://")
        .or_else(|| address.strip_prefix("http://"))
        .unwrap_or(address);
    stripped.split('/').next().unwrap_or(stripped)
}
