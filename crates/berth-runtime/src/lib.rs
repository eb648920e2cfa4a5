//! # berth-runtime
//!
//! Runs containers on a remote engine for an invoking host.
//!
//! - [`mapping`] turns a [`RunSpec`](berth_common::run_spec::RunSpec) into
//!   engine create parameters.
//! - [`lifecycle`] creates, starts, waits for, stops and removes containers.
//! - [`stream`] attaches to a container and copies its I/O while it runs.
//! - [`upload`] streams single files into a container.
//! - [`ContainerRuntime`] ties these together behind a lazily connected
//!   engine handle.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod lifecycle;
pub mod mapping;
pub mod runtime;
pub mod stream;
pub mod upload;

pub use lifecycle::LifecycleController;
pub use runtime::ContainerRuntime;
pub use stream::{StreamConfig, StreamSession};
pub use upload::FileInjector;
