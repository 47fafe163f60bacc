// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

//! Start, track and reap every process launched for a mount.

mod hook;
mod process;

use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

pub use self::hook::{EnvHook, LaunchHook, NoHook};
pub use self::process::{Exit, ManagedProcess, ProcessSpec, Program};
use crate::{Error, Result};


/// Process counts captured together under the registry lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Every process ever started by the supervisor
    pub started: usize,
    /// Processes started but not yet reaped
    pub live: usize,
    /// Reaped processes that did not exit with code zero
    pub failed: usize,
}

/// Owns the set of live processes.
///
/// A process is registered when it is started and removed exactly
/// once, by its own reaper task, after its exit has been recorded.
pub struct Supervisor {
    registry: Mutex<Vec<Arc<ManagedProcess>>>,
    started: AtomicUsize,
    failed: AtomicUsize,
    live: watch::Sender<usize>,
    hook: Box<dyn LaunchHook>,
    shell: OsString,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("started", &self.started)
            .field("live", &*self.live.borrow())
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(hook: impl LaunchHook + 'static) -> Self {
        Self {
            registry: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            live: watch::Sender::new(0),
            hook: Box::new(hook),
            shell: OsString::from("sh"),
        }
    }

    /// Use a different shell to run script bodies
    pub fn with_shell<S: Into<OsString>>(mut self, shell: S) -> Self {
        self.shell = shell.into();
        self
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Arc<ManagedProcess>>> {
        // the registry is never left half-updated, so a
        // panic elsewhere does not invalidate its contents
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch and register a new process.
    ///
    /// Nothing is registered if the process cannot be launched.
    pub async fn start(self: &Arc<Self>, spec: ProcessSpec) -> Result<Arc<ManagedProcess>> {
        let (mut cmd, body) = spec.build(&self.shell)?;
        self.hook.prepare(&mut cmd);
        let name = spec.name();
        tracing::debug!(%name, "starting process");
        let mut child = cmd
            .spawn()
            .map_err(|err| Error::process_spawn_error(&name, err, spec.current_dir.clone()))?;
        // drop our copies of any redirected descriptors
        drop(cmd);
        let Some(pid) = child.id() else {
            return Err(Error::String(format!("{name} exited before it was registered")));
        };
        let stdin = child.stdin.take();
        let process = Arc::new(ManagedProcess::new(pid, name));
        {
            let mut registry = self.registry();
            registry.push(Arc::clone(&process));
            self.started.fetch_add(1, Ordering::SeqCst);
            self.live.send_replace(registry.len());
        }
        tracing::debug!(pid, name = %process.name(), "process registered");

        let supervisor = Arc::clone(self);
        let reaped = Arc::clone(&process);
        tokio::spawn(async move {
            if let (Some(mut stdin), Some(body)) = (stdin, body) {
                feed_script(&mut stdin, body).await;
            }
            let exit = match child.wait().await {
                Ok(status) => Exit::from(status),
                Err(err) => Exit::Failed(err.to_string()),
            };
            supervisor.reap(&reaped, exit);
        });
        Ok(process)
    }

    fn reap(&self, process: &Arc<ManagedProcess>, exit: Exit) {
        tracing::debug!(pid = process.pid(), name = %process.name(), %exit, "process exited");
        if !exit.success() {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        process.complete(exit);
        let mut registry = self.registry();
        registry.retain(|p| !Arc::ptr_eq(p, process));
        self.live.send_replace(registry.len());
    }

    /// Wait until no registered processes remain.
    pub async fn wait_all(&self) {
        let mut live = self.live.subscribe();
        // the sender is owned by self, so this cannot fail while we wait
        let _ = live.wait_for(|count| *count == 0).await;
    }

    /// Send a signal to every registered process that has not exited,
    /// returning the number of processes that were signalled.
    pub fn broadcast(&self, signal: Signal) -> usize {
        let registry = self.registry();
        let mut count = 0;
        for process in registry.iter().filter(|p| !p.is_done()) {
            let pid = Pid::from_raw(process.pid() as i32);
            match kill(pid, signal) {
                Ok(()) => count += 1,
                Err(err) => {
                    tracing::debug!(pid = process.pid(), ?signal, %err, "failed to signal process")
                }
            }
        }
        tracing::debug!(?signal, count, "signal forwarded");
        count
    }

    /// The number of processes ever started by this supervisor
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Snapshot {
        let registry = self.registry();
        Snapshot {
            started: self.started.load(Ordering::SeqCst),
            live: registry.len(),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    /// The processes that are currently registered
    pub fn processes(&self) -> Vec<Arc<ManagedProcess>> {
        self.registry().clone()
    }
}

async fn feed_script(stdin: &mut tokio::process::ChildStdin, body: Bytes) {
    // a script that exits without reading all of its
    // input will close the pipe early, which is fine
    if let Err(err) = stdin.write_all(&body).await {
        tracing::debug!(%err, "script input was not fully consumed");
    }
    if let Err(err) = stdin.shutdown().await {
        tracing::debug!(%err, "failed to close script input");
    }
}
