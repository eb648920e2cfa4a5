//! # berth-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire Berth workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the run specification, the error taxonomy and
//! the engine connection settings that all other crates build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod run_spec;
pub mod types;
