// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::{OsStr, OsString};
use std::os::fd::{BorrowedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::watch;

use crate::{Error, Result};

/// What a managed process should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Execute a program directly with the given arguments
    Command { program: OsString, args: Vec<OsString> },
    /// Feed a script body to the shell over stdin, passing
    /// the given arguments as positional parameters
    Script { body: Bytes, args: Vec<OsString> },
}

/// Describes a process to be started by the [`super::Supervisor`].
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: Program,
    /// Descriptor of the caller that should become stdout
    pub stdout: Option<RawFd>,
    /// Descriptor of the caller that should become stderr
    pub stderr: Option<RawFd>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    /// Start the process as the leader of its own process group
    pub new_process_group: bool,
}

impl ProcessSpec {
    pub fn command<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self::new(Program::Command {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    pub fn script<B: Into<Bytes>>(body: B) -> Self {
        Self::new(Program::Script {
            body: body.into(),
            args: Vec::new(),
        })
    }

    fn new(program: Program) -> Self {
        Self {
            program,
            stdout: None,
            stderr: None,
            current_dir: None,
            env: Vec::new(),
            new_process_group: false,
        }
    }

    /// Positional arguments for a script, ignored for commands
    pub fn with_script_args<I, A>(mut self, new_args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        if let Program::Script { args, .. } = &mut self.program {
            args.extend(new_args.into_iter().map(Into::into));
        }
        self
    }

    pub fn with_stdout(mut self, fd: RawFd) -> Self {
        self.stdout = Some(fd);
        self
    }

    pub fn with_stderr(mut self, fd: RawFd) -> Self {
        self.stderr = Some(fd);
        self
    }

    pub fn with_current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_env<K: Into<OsString>, V: Into<OsString>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn in_new_process_group(mut self) -> Self {
        self.new_process_group = true;
        self
    }

    /// A short, human readable name for this process
    pub fn name(&self) -> String {
        match &self.program {
            Program::Command { program, .. } => program.to_string_lossy().into_owned(),
            Program::Script { .. } => "<script>".to_string(),
        }
    }

    /// Build the command for this spec, returning it alongside
    /// any data that still needs to be written to its stdin.
    pub(super) fn build(&self, shell: &OsStr) -> Result<(tokio::process::Command, Option<Bytes>)> {
        let (mut cmd, stdin_body) = match &self.program {
            Program::Command { program, args } => {
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(args);
                (cmd, None)
            }
            Program::Script { body, args } => {
                let mut cmd = tokio::process::Command::new(shell);
                cmd.arg("-s").args(args);
                cmd.stdin(Stdio::piped());
                (cmd, Some(body.clone()))
            }
        };
        if let Some(stdout) = redirect(self.stdout, libc::STDOUT_FILENO)? {
            cmd.stdout(stdout);
        }
        if let Some(stderr) = redirect(self.stderr, libc::STDERR_FILENO)? {
            cmd.stderr(stderr);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        if self.new_process_group {
            cmd.process_group(0);
        }
        Ok((cmd, stdin_body))
    }
}

/// Duplicate the requested descriptor for use by a child, unless it
/// is missing, invalid or already the stream being replaced.
fn redirect(fd: Option<RawFd>, own: RawFd) -> Result<Option<Stdio>> {
    let Some(fd) = fd else {
        return Ok(None);
    };
    if fd <= 0 || fd == own {
        return Ok(None);
    }
    // Safety: the descriptor is only borrowed long enough to duplicate
    // it, and a closed descriptor is reported as an error by the dup
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let owned = borrowed
        .try_clone_to_owned()
        .map_err(|err| Error::InvalidDescriptor(fd, err))?;
    Ok(Some(Stdio::from(owned)))
}

/// How a managed process finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// The process exited normally with this code
    Code(i32),
    /// The process was terminated by this signal
    Signal(i32),
    /// The process could not be waited on
    Failed(String),
}

impl Exit {
    /// The exit code that a shell would report for this outcome
    pub fn code(&self) -> i32 {
        match self {
            Self::Code(code) => *code,
            Self::Signal(signal) => 128 + signal,
            Self::Failed(_) => 1,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(signal)) => Self::Signal(signal),
            (None, None) => Self::Failed(format!("unrecognized exit status: {status}")),
        }
    }
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// A process started and tracked by the supervisor.
///
/// Only the supervisor's reaper for this process records its
/// exit and marks it as done.
#[derive(Debug)]
pub struct ManagedProcess {
    pid: u32,
    name: String,
    done: AtomicBool,
    exit: watch::Sender<Option<Exit>>,
}

impl ManagedProcess {
    pub(super) fn new(pid: u32, name: String) -> Self {
        Self {
            pid,
            name,
            done: AtomicBool::new(false),
            exit: watch::Sender::new(None),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// The exit of this process, if it has been reaped
    pub fn exit(&self) -> Option<Exit> {
        self.exit.borrow().clone()
    }

    /// Wait for this process to be reaped
    pub async fn wait(&self) -> Exit {
        let mut rx = self.exit.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or_else(|| Exit::Failed("no exit recorded".into())),
            // the sender lives in self, so it cannot be dropped while we wait
            Err(_) => Exit::Failed("process tracking ended".into()),
        }
    }

    pub(super) fn complete(&self, exit: Exit) {
        self.done.store(true, Ordering::Release);
        self.exit.send_replace(Some(exit));
    }
}
