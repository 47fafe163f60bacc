// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

//! Serve a bundled content tree as live mounts and supervise
//! the processes that run against them.

#![deny(unsafe_op_in_unsafe_fn)]

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
pub mod fixtures;

pub mod bootstrap;
pub mod config;
pub mod content;
mod error;
pub mod mount;
pub mod spawn;
pub mod supervisor;

pub use config::{Config, get_config, load_config};
pub use error::{Error, Result, describe_chain};
