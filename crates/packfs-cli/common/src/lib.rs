// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

//! Common macros and argument structures for the packfs command line

mod args;

pub use args::{Logging, configure_logging, log_directives};
