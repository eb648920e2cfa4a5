//! System-wide constants and defaults.

/// Engine API version used when none is configured.
pub const DEFAULT_API_VERSION: &str = "1.39";

/// Environment variable naming a JSON engine configuration file.
pub const ENV_CONFIG_PATH: &str = "BERTH_DOCKER_CONFIG";
/// Environment variable overriding the engine host address.
pub const ENV_HOST: &str = "DOCKER_HOST";
/// Environment variable overriding the engine API version.
pub const ENV_API_VERSION: &str = "DOCKER_API_VERSION";
/// Environment variable naming the directory holding TLS material.
pub const ENV_CERT_PATH: &str = "DOCKER_CERT_PATH";
/// Environment variable asking clients to verify the engine certificate.
pub const ENV_TLS_VERIFY: &str = "DOCKER_TLS_VERIFY";

/// CA certificate file name inside the cert directory.
pub const CA_FILE: &str = "ca.pem";
/// Client certificate file name inside the cert directory.
pub const CERT_FILE: &str = "cert.pem";
/// Client key file name inside the cert directory.
pub const KEY_FILE: &str = "key.pem";

/// Tag applied to image names that carry neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";
/// Registry assumed for image names without a domain.
pub const DEFAULT_DOMAIN: &str = "docker.io";
/// Credential key of the official index.
pub const INDEX_SERVER: &str = "https://index.docker.io/v1/";

/// Permission bits of files injected into a container.
pub const UPLOAD_FILE_MODE: u32 = 0o644;

/// Interpreter running an entrypoint script when none is given.
pub const DEFAULT_INTERPRETER: &str = "/bin/sh";
/// Prefix of the scratch directory an entrypoint script is written to.
pub const SCRIPT_DIR_PREFIX: &str = "/tmp/berth-";
/// File name of the entrypoint script inside its scratch directory.
pub const SCRIPT_FILE: &str = "entrypoint";

/// Wait condition that covers both exit and cleanup of a container.
pub const WAIT_CONDITION_REMOVED: &str = "removed";

/// Engine identifier reported in diagnostics.
pub const ENGINE_NAME: &str = "docker";
