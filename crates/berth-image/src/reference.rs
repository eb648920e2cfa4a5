//! Image reference parsing and normalization.
//!
//! Two entry points mirror the two ways a name is looked at:
//! [`parse_any`] accepts a bare image ID or digest as well as a name, and is
//! what is checked against local images; [`NamedReference::parse_normalized`]
//! turns a familiar name such as `alpine` into `docker.io/library/alpine` and
//! is what gets pulled. Name grammar and Docker Hub normalization come from
//! [`oci_client::Reference`].

use std::fmt;

use berth_common::constants::{DEFAULT_DOMAIN, DEFAULT_TAG, INDEX_SERVER};
use berth_common::error::{BerthError, Result};
use oci_client::Reference;

/// Length of a hex-encoded SHA-256 image ID.
const ID_HEX_LEN: usize = 64;

fn invalid(reference: &str, message: impl Into<String>) -> BerthError {
    BerthError::Reference {
        reference: reference.to_string(),
        message: message.into(),
    }
}

/// Either a content digest or a named reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyReference {
    /// A bare digest such as `sha256:<hex>`.
    Digest(String),
    /// A normalized repository reference.
    Named(NamedReference),
}

impl fmt::Display for AnyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digest(digest) => f.write_str(digest),
            Self::Named(named) => named.fmt(f),
        }
    }
}

/// Parses a name that may also be a 64-hex image ID or a digest.
///
/// # Errors
///
/// Returns `Reference` if the input is neither.
pub fn parse_any(input: &str) -> Result<AnyReference> {
    if is_image_id(input) {
        return Ok(AnyReference::Digest(format!("sha256:{input}")));
    }
    if is_digest(input) {
        return Ok(AnyReference::Digest(input.to_string()));
    }
    NamedReference::parse_normalized(input).map(AnyReference::Named)
}

/// A fully qualified repository reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl NamedReference {
    /// Parses and normalizes a familiar image name.
    ///
    /// Names without a registry go to `docker.io`, and single-component
    /// names there gain the `library/` prefix. No tag is added.
    ///
    /// # Errors
    ///
    /// Returns `Reference` for a malformed name, an upper-case repository,
    /// an over-long name, or a bare 64-hex string.
    pub fn parse_normalized(input: &str) -> Result<Self> {
        if is_image_id(input) {
            return Err(invalid(
                input,
                "cannot specify 64-byte hexadecimal strings as a repository name",
            ));
        }
        let parsed: Reference = input.parse::<Reference>().map_err(|e| invalid(input, e.to_string()))?;

        Ok(Self {
            registry: parsed.registry().to_string(),
            repository: parsed.repository().to_string(),
            tag: if has_explicit_tag(input) {
                parsed.tag().map(str::to_string)
            } else {
                None
            },
            digest: parsed.digest().map(str::to_string),
        })
    }

    /// Registry host, possibly with a port.
    #[must_use]
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag, if one was given.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Digest, if one was given.
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Whether the reference carries neither tag nor digest.
    #[must_use]
    pub const fn is_name_only(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// Adds the default tag to a name-only reference. Anything else is
    /// returned unchanged.
    #[must_use]
    pub fn with_default_tag(mut self) -> Self {
        if self.is_name_only() {
            self.tag = Some(DEFAULT_TAG.to_string());
        }
        self
    }

    /// Whether the reference points at the official Docker Hub index.
    #[must_use]
    pub fn is_official_index(&self) -> bool {
        self.registry == DEFAULT_DOMAIN
    }

    /// Key under which credentials for this reference's registry are stored.
    #[must_use]
    pub fn auth_key(&self) -> &str {
        if self.is_official_index() {
            INDEX_SERVER
        } else {
            &self.registry
        }
    }
}

impl fmt::Display for NamedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Whether the last path component of the name part carries a `:tag`.
fn has_explicit_tag(input: &str) -> bool {
    let name = input.split_once('@').map_or(input, |(name, _)| name);
    name.rsplit('/').next().is_some_and(|last| last.contains(':'))
}

fn is_lower_hex(input: &str) -> bool {
    input
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn is_image_id(input: &str) -> bool {
    input.len() == ID_HEX_LEN && is_lower_hex(input)
}

/// A bare `algorithm:hex` content digest.
fn is_digest(input: &str) -> bool {
    let Some((algorithm, encoded)) = input.split_once(':') else {
        return false;
    };
    let expected = match algorithm {
        "sha256" => 64,
        "sha384" => 96,
        "sha512" => 128,
        _ => return false,
    };
    encoded.len() == expected && is_lower_hex(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalized(input: &str) -> String {
        NamedReference::parse_normalized(input)
            .expect("valid reference")
            .to_string()
    }

    #[test]
    fn familiar_names_are_qualified() {
        assert_eq!(normalized("alpine"), "docker.io/library/alpine");
        assert_eq!(normalized("alpine:3.20"), "docker.io/library/alpine:3.20");
        assert_eq!(normalized("user/app"), "docker.io/user/app");
        assert_eq!(normalized("index.docker.io/alpine"), "docker.io/library/alpine");
        assert_eq!(
            normalized("registry.example.com:5000/team/app:v1"),
            "registry.example.com:5000/team/app:v1"
        );
        assert_eq!(normalized("localhost/app"), "localhost/app");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let reference = NamedReference::parse_normalized("localhost:5000/app").expect("parse");
        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.repository(), "app");
        assert!(reference.is_name_only());
    }

    #[test]
    fn default_tag_is_applied_once() {
        let reference = NamedReference::parse_normalized("alpine")
            .expect("parse")
            .with_default_tag()
            .with_default_tag();
        assert_eq!(reference.to_string(), "docker.io/library/alpine:latest");

        let tagged = NamedReference::parse_normalized("alpine:edge")
            .expect("parse")
            .with_default_tag();
        assert_eq!(tagged.tag(), Some("edge"));
    }

    #[test]
    fn digest_references_keep_their_digest_and_gain_no_tag() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let reference = NamedReference::parse_normalized(&format!("alpine@{digest}"))
            .expect("parse")
            .with_default_tag();
        assert_eq!(reference.tag(), None);
        assert_eq!(reference.digest(), Some(digest.as_str()));
        assert_eq!(reference.to_string(), format!("docker.io/library/alpine@{digest}"));
    }

    #[test]
    fn bare_image_id_parses_as_digest_but_not_as_name() {
        let id = "0123456789abcdef".repeat(4);
        assert_eq!(
            parse_any(&id).expect("any").to_string(),
            format!("sha256:{id}")
        );
        assert!(NamedReference::parse_normalized(&id).is_err());
    }

    #[test]
    fn bare_digest_is_kept_verbatim() {
        let digest = format!("sha256:{}", "b".repeat(64));
        assert_eq!(parse_any(&digest).expect("any"), AnyReference::Digest(digest.clone()));
        assert!(!is_digest("sha256:abc"));
        assert!(!is_digest(&format!("md5:{}", "b".repeat(64))));
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in ["Alpine", "alpine:", "-alpine", "alpine//x", "alpine:bad tag", ""] {
            let err = NamedReference::parse_normalized(bad).expect_err(bad);
            assert!(matches!(err, BerthError::Reference { .. }), "{bad}");
        }
        let long = format!("a/{}", "b".repeat(255));
        assert!(NamedReference::parse_normalized(&long).is_err());
    }

    #[test]
    fn auth_key_uses_index_server_for_docker_hub() {
        let hub = NamedReference::parse_normalized("alpine").expect("parse");
        assert!(hub.is_official_index());
        assert_eq!(hub.auth_key(), INDEX_SERVER);

        let private = NamedReference::parse_normalized("ghcr.io/org/app").expect("parse");
        assert_eq!(private.auth_key(), "ghcr.io");
    }
}
