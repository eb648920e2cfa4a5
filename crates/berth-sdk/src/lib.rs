//! # berth-sdk
//!
//! Using Berth as a Rust library.
//!
//! - [`RunSpecBuilder`](builder::RunSpecBuilder): fluent construction of a
//!   run specification.
//! - [`ContainerRuntime`]: create, stream, resize and delete containers on
//!   the engine named by `DOCKER_HOST`.
//!
//! # Example
//!
//! ```rust,no_run
//! use berth_sdk::builder::RunSpecBuilder;
//! use berth_sdk::{ContainerRuntime, StreamConfig};
//!
//! # async fn run() -> berth_sdk::Result<()> {
//! let runtime = ContainerRuntime::from_env();
//! let image = runtime.resolve_image("alpine").await?;
//! let spec = RunSpecBuilder::new(image)
//!     .command(["echo", "hi"])
//!     .stdio(true)
//!     .build()?;
//!
//! let id = runtime.create_container(&spec).await?;
//! let result = runtime.stream_container(&id, StreamConfig::stdio()).await?;
//! assert_eq!(result.exit_code, 0);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod builder;

pub use berth_common::error::{BerthError, Result};
pub use berth_common::run_spec::RunSpec;
pub use berth_common::types::{ContainerId, RunResult, TerminalSize};
pub use berth_image::{CredentialStore, StaticCredentials};
pub use berth_runtime::{ContainerRuntime, StreamConfig};
