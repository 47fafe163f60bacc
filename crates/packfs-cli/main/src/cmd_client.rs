// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

//! The thin clients that processes inside a mount use to reach
//! back to the packfs instance that started them.
//!
//! These are selected by a marker as the first argument, ahead
//! of any regular command line parsing:
//!
//! ```text
//! packfs !cmd <port> <program> [args...]
//! packfs !script <port>        # script body on stdin
//! packfs !umount <port>
//! ```

use std::os::fd::AsRawFd;

use miette::{Context, IntoDiagnostic, Result, miette};
use packfs::mount::UnmountSignal;
use packfs::spawn::{SpawnRequest, client};
use tokio::io::AsyncReadExt;

#[cfg(test)]
#[path = "./cmd_client_test.rs"]
mod cmd_client_test;

const CMD_MARKER: &str = "!cmd";
const SCRIPT_MARKER: &str = "!script";
const UMOUNT_MARKER: &str = "!umount";

/// A client invocation, parsed from the raw command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// Ask the spawn service to run a command
    Command { port: u16, command: Vec<String> },
    /// Ask the spawn service to run the script read from stdin
    Script { port: u16 },
    /// Force the mount behind an unmount signal port to detach
    Unmount { port: u16 },
}

impl Marker {
    /// Recognize a client invocation from the full argument list,
    /// including the program name.
    ///
    /// Returns None when the arguments are for the orchestrator.
    pub fn parse(args: &[String]) -> Option<Result<Self>> {
        let [_, marker, port, rest @ ..] = args else {
            return None;
        };
        if !matches!(marker.as_str(), CMD_MARKER | SCRIPT_MARKER | UMOUNT_MARKER) {
            return None;
        }
        Some(Self::from_parts(marker, port, rest))
    }

    fn from_parts(marker: &str, port: &str, rest: &[String]) -> Result<Self> {
        let port = port
            .parse::<u16>()
            .into_diagnostic()
            .wrap_err_with(|| format!("Invalid port for {marker}: {port:?}"))?;
        match marker {
            CMD_MARKER if rest.is_empty() => Err(miette!("{CMD_MARKER} requires a program to run")),
            CMD_MARKER => Ok(Self::Command {
                port,
                command: rest.to_vec(),
            }),
            SCRIPT_MARKER => Ok(Self::Script { port }),
            _ => Ok(Self::Unmount { port }),
        }
    }

    /// Perform the request, returning the exit code for this process
    pub async fn run(self) -> Result<i32> {
        let (port, request) = match self {
            Self::Unmount { port } => {
                UnmountSignal::trigger(port).await?;
                return Ok(0);
            }
            Self::Command { port, command } => (port, SpawnRequest::command(command)),
            Self::Script { port } => {
                let mut body = String::new();
                tokio::io::stdin()
                    .read_to_string(&mut body)
                    .await
                    .into_diagnostic()
                    .wrap_err("Failed to read script from stdin")?;
                (port, SpawnRequest::script(body))
            }
        };
        // the new process writes wherever this one was told to
        let request =
            request.with_output(std::io::stdout().as_raw_fd(), std::io::stderr().as_raw_fd());
        tracing::debug!(port, ?request.command, "sending spawn request");
        let response = client::request(port, &request).await?;

        println!("{}", response.pid);
        if !response.error.is_empty() {
            eprintln!("{}", response.error);
        }
        Ok(response.exit_code)
    }
}
