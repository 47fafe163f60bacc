// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;

use miette::Diagnostic;
use relative_path::RelativePathBuf;
use thiserror::Error;

#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    #[error("{0}")]
    String(String),

    #[error("Content not found: {0}")]
    #[diagnostic(code("packfs::content_not_found"))]
    ContentNotFound(RelativePathBuf),
    #[error("Failed to read content {0}")]
    ContentReadError(RelativePathBuf, #[source] io::Error),
    #[error("Failed to open bundle {0:?}")]
    #[diagnostic(
        code("packfs::bundle"),
        help("The bundle must be a tar archive or a directory containing main.sh")
    )]
    BundleOpenError(PathBuf, #[source] io::Error),
    #[error("Invalid path in bundle: {0:?}")]
    InvalidBundlePath(PathBuf),

    #[error("Failed to spawn {program}{}", describe_cwd(.cwd))]
    #[diagnostic(code("packfs::process_spawn"))]
    ProcessSpawnError {
        program: String,
        #[source]
        err: io::Error,
        cwd: Option<PathBuf>,
    },
    #[error("Descriptor {0} cannot be used for redirection")]
    InvalidDescriptor(RawFd, #[source] io::Error),

    #[error("Failed to create mount directory {0:?}")]
    MountDirError(PathBuf, #[source] io::Error),
    #[error("Failed to mount {0}")]
    MountError(String, #[source] io::Error),
    #[error("Failed to bind control listener")]
    ListenerError(#[source] io::Error),
    #[error("Failed to reach unmount signal on port {0}")]
    UnmountTriggerError(u16, #[source] io::Error),
    #[error("Remote spawn exchange failed: {0}")]
    SpawnProtocolError(#[source] io::Error),
    #[error("Spawn request is larger than {0} bytes")]
    SpawnRequestTooLarge(u64),

    #[error("Cannot load config, lock has been poisoned: {0}")]
    LockPoisonedRead(String),
    #[error("Cannot update config, lock has been poisoned: {0}")]
    LockPoisonedWrite(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    IO(#[from] io::Error),
}

impl Error {
    pub fn process_spawn_error<S: Into<String>>(
        program: S,
        err: io::Error,
        cwd: Option<PathBuf>,
    ) -> Self {
        Self::ProcessSpawnError {
            program: program.into(),
            err,
            cwd,
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::String(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Self::String(err.to_string())
    }
}

/// Render an error and each of its sources as a single line.
pub fn describe_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        let next = err.to_string();
        if !message.ends_with(&next) {
            message.push_str(": ");
            message.push_str(&next);
        }
        source = err.source();
    }
    message
}

fn describe_cwd(cwd: &Option<PathBuf>) -> String {
    match cwd {
        Some(cwd) => format!(" in {cwd:?}"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
