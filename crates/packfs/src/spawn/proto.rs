// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};

use crate::supervisor::ProcessSpec;

/// The largest request that the service will read from a connection
pub const MAX_REQUEST_SIZE: u64 = 1024 * 1024;

/// Asks the service to start a new supervised process.
///
/// A non-empty `command` is executed directly, otherwise the
/// `script` is fed to the shell. The `out` and `err` descriptors
/// are only meaningful to processes that share a descriptor
/// table ancestry with the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SpawnRequest {
    pub out: RawFd,
    pub err: RawFd,
    pub script: String,
    pub command: Vec<String>,
}

impl SpawnRequest {
    pub fn command<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn script<S: Into<String>>(body: S) -> Self {
        Self {
            script: body.into(),
            ..Default::default()
        }
    }

    /// Redirect output of the new process to these descriptors
    pub fn with_output(mut self, out: RawFd, err: RawFd) -> Self {
        self.out = out;
        self.err = err;
        self
    }

    /// The process that should be started for this request
    pub fn to_process_spec(&self) -> ProcessSpec {
        let spec = match self.command.split_first() {
            Some((program, args)) => ProcessSpec::command(program, args),
            None => ProcessSpec::script(self.script.clone()),
        };
        let spec = if self.out > 0 {
            spec.with_stdout(self.out)
        } else {
            spec
        };
        if self.err > 0 {
            spec.with_stderr(self.err)
        } else {
            spec
        }
    }
}

/// The answer to a single [`SpawnRequest`].
///
/// An empty `error` means that the process was started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SpawnResponse {
    pub pid: u32,
    pub error: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

impl SpawnResponse {
    pub fn started(pid: u32) -> Self {
        Self {
            pid,
            error: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed<E: std::fmt::Display>(err: E) -> Self {
        let error = err.to_string();
        Self {
            pid: 0,
            // an error must never read as success
            error: if error.is_empty() {
                "unknown error".to_string()
            } else {
                error
            },
            exit_code: 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}
