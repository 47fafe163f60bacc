// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use miette::Diagnostic;
use thiserror::Error;

/// Errors specific to building and serving a filesystem.
#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    /// The content source could not be listed.
    #[error("Failed to list filesystem content")]
    #[diagnostic(forward(0))]
    Content(#[source] packfs::Error),

    /// The filesystem could not be attached to its mount point.
    #[error("Failed to mount filesystem at {0:?}")]
    Mount(std::path::PathBuf, #[source] std::io::Error),

    /// A generic string error.
    #[error("{0}")]
    String(String),
}

impl From<packfs::Error> for Error {
    fn from(err: packfs::Error) -> Self {
        Self::Content(err)
    }
}
