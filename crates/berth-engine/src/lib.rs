//! # berth-engine
//!
//! The boundary between Berth and a remote container engine.
//!
//! This crate provides:
//! - **Engine trait**: [`ContainerEngine`](engine::ContainerEngine), the
//!   narrow set of create/start/stop/attach/wait/pull calls the runtime needs.
//! - **Parameters**: engine-neutral container create parameters.
//! - **Framing**: decoding of the multiplexed stdout/stderr attach stream.
//! - **Pull messages**: the progress records of an image pull.
//! - **Docker backend**: a [`DockerEngine`](docker::DockerEngine) speaking
//!   the Docker Engine API through `bollard`.
//! - **Upgraded connections**: the raw byte stream behind an attach, opened
//!   over a socket, plain TCP or TLS.
//! - **Handle**: an [`EngineHandle`](handle::EngineHandle) connecting once, on
//!   first use.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod docker;
pub mod engine;
pub mod frame;
pub mod handle;
pub mod params;
pub mod pull;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod upgrade;

pub use engine::{AttachedStreams, ContainerEngine};
pub use handle::EngineHandle;
