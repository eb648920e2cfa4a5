//! # berth-image
//!
//! Image name handling for the Berth runtime.
//!
//! Handles:
//! - **References**: parsing and Docker Hub normalization of image names.
//! - **Credentials**: the lookup seam for registry credentials.
//! - **Pulls**: draining a pull's progress stream, failing on embedded errors.
//! - **Resolution**: local-first resolution with pull on miss.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod credentials;
pub mod pull;
pub mod reference;
pub mod resolver;

pub use credentials::{Anonymous, CredentialStore, StaticCredentials};
pub use resolver::ImageResolver;
