// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of a single mount point, from directory creation
//! through graceful or forced detachment.

mod signal;

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use self::signal::UnmountSignal;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./mount_test.rs"]
mod mount_test;

/// The task that serves a mounted filesystem until it is detached
pub type ServerHandle = JoinHandle<std::io::Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    /// Ask the filesystem to detach, which fails while it is busy
    Graceful,
    /// Lazily detach, even while the filesystem is in use
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting(UnmountMode),
}

/// The commands run to detach a mount, each is given
/// the mount path as its last argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmountCommands {
    pub graceful: Vec<String>,
    pub force: Vec<String>,
}

impl Default for UnmountCommands {
    fn default() -> Self {
        crate::config::Unmount::default().into()
    }
}

impl From<crate::config::Unmount> for UnmountCommands {
    fn from(config: crate::config::Unmount) -> Self {
        Self {
            graceful: config.graceful_command,
            force: config.force_command,
        }
    }
}

/// One named mount point and the server behind it.
///
/// Every state change is a single check-and-set on the state, so
/// exactly one caller wins each transition. No lock is held while
/// an unmount command runs, which lets a forced unmount take over
/// from a graceful one that is stuck waiting on a busy mount.
#[derive(Debug)]
pub struct Mount {
    name: String,
    path: PathBuf,
    dir_mode: u32,
    commands: UnmountCommands,
    server: std::sync::Mutex<Option<ServerHandle>>,
    state: watch::Sender<MountState>,
}

impl Mount {
    pub fn new<N, P>(name: N, path: P, dir_mode: u32, commands: UnmountCommands) -> Self
    where
        N: Into<String>,
        P: Into<PathBuf>,
    {
        Self {
            name: name.into(),
            path: path.into(),
            dir_mode,
            commands,
            server: std::sync::Mutex::new(None),
            state: watch::Sender::new(MountState::Unmounted),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The filesystem name shown in the system mount table
    pub fn fs_name(&self) -> String {
        format!("packfs-{}", self.name)
    }

    pub fn state(&self) -> MountState {
        *self.state.borrow()
    }

    /// Observe every change in the state of this mount
    pub fn subscribe(&self) -> watch::Receiver<MountState> {
        self.state.subscribe()
    }

    /// Wait until this mount is not attached
    pub async fn unmounted(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == MountState::Unmounted).await;
    }

    /// Move to a new state if the current one is accepted by `from`,
    /// returning false when some other state was found.
    fn transition<F>(&self, from: F, to: MountState) -> bool
    where
        F: FnOnce(MountState) -> bool,
    {
        self.state.send_if_modified(|state| {
            if !from(*state) {
                return false;
            }
            *state = to;
            true
        })
    }

    fn server(&self) -> MutexGuard<'_, Option<ServerHandle>> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the mount directory and attach a filesystem to it.
    ///
    /// The given function performs the actual mount and returns the task
    /// that serves it. If it fails, the mount directory is removed again.
    pub async fn mount_with<F>(&self, serve: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<ServerHandle>,
    {
        if !self.transition(|s| s == MountState::Unmounted, MountState::Mounting) {
            return Err(Error::String(format!(
                "{} cannot be mounted while {:?}",
                self.name,
                self.state()
            )));
        }
        if let Err(err) = std::fs::DirBuilder::new()
            .mode(self.dir_mode)
            .create(&self.path)
        {
            self.state.send_replace(MountState::Unmounted);
            return Err(Error::MountDirError(self.path.clone(), err));
        }
        match serve(&self.path) {
            Ok(handle) => {
                *self.server() = Some(handle);
                self.state.send_replace(MountState::Mounted);
                tracing::debug!(name = %self.name, path = ?self.path, "mounted");
                Ok(())
            }
            Err(err) => {
                self.remove_dir();
                self.state.send_replace(MountState::Unmounted);
                Err(err)
            }
        }
    }

    /// Detach gracefully, falling back to a forced unmount when
    /// the filesystem refuses.
    ///
    /// Does nothing unless mounted, but waits for an unmount that
    /// is already in progress to complete.
    pub async fn unmount(&self) {
        let graceful = MountState::Unmounting(UnmountMode::Graceful);
        if !self.transition(|s| s == MountState::Mounted, graceful) {
            if matches!(self.state(), MountState::Unmounting(_)) {
                self.unmounted().await;
            }
            return;
        }

        let mut state = self.state.subscribe();
        let result = tokio::select! {
            result = run_unmount(&self.commands.graceful, &self.path) => result,
            _ = async { drop(state.wait_for(|s| *s != graceful).await) } => {
                // the command is killed as it is dropped
                tracing::debug!(name = %self.name, "graceful unmount abandoned");
                self.unmounted().await;
                return;
            }
        };

        match result {
            Ok(()) => {
                tracing::debug!(name = %self.name, "unmounted");
                let handle = self.server().take();
                if let Some(handle) = handle {
                    join_server(&self.name, handle).await;
                }
                self.finish(UnmountMode::Graceful);
            }
            Err(err) => {
                tracing::warn!(
                    name = %self.name,
                    "graceful unmount failed, forcing: {}",
                    crate::describe_chain(&err)
                );
                let forced = MountState::Unmounting(UnmountMode::Forced);
                if self.transition(|s| s == graceful, forced) {
                    self.force().await;
                } else {
                    self.unmounted().await;
                }
            }
        }
    }

    /// Lazily detach without first asking the filesystem.
    ///
    /// This takes over from a graceful unmount that is still running,
    /// and does nothing if the mount is not attached or is already
    /// being forced.
    pub async fn force_unmount(&self) {
        let claimed = self.transition(
            |s| {
                matches!(
                    s,
                    MountState::Mounted | MountState::Unmounting(UnmountMode::Graceful)
                )
            },
            MountState::Unmounting(UnmountMode::Forced),
        );
        if claimed {
            self.force().await;
        }
    }

    async fn force(&self) {
        match run_unmount(&self.commands.force, &self.path).await {
            Ok(()) => tracing::info!(name = %self.name, "forced unmount"),
            Err(err) => tracing::error!(
                name = %self.name,
                "forced unmount failed: {}",
                crate::describe_chain(&err)
            ),
        }
        // a lazily detached server may linger until it is no longer
        // in use, so it is left to finish on its own
        drop(self.server().take());
        self.finish(UnmountMode::Forced);
    }

    /// Complete an unmount, unless another one has taken it over
    fn finish(&self, mode: UnmountMode) {
        self.state.send_if_modified(|state| {
            if *state != MountState::Unmounting(mode) {
                return false;
            }
            self.remove_dir();
            *state = MountState::Unmounted;
            true
        });
    }

    fn remove_dir(&self) {
        if let Err(err) = std::fs::remove_dir(&self.path) {
            tracing::warn!(path = ?self.path, %err, "failed to remove mount directory");
        }
    }
}

async fn join_server(name: &str, handle: ServerHandle) {
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(%name, %err, "filesystem server ended with an error"),
        Err(err) => tracing::warn!(%name, %err, "filesystem server task failed"),
    }
}

async fn run_unmount(command: &[String], path: &Path) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        return Err(Error::String("no unmount command configured".to_string()));
    };
    tracing::debug!(%program, ?args, ?path, "running unmount command");
    let status = tokio::process::Command::new(program)
        .args(args)
        .arg(path)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|err| Error::process_spawn_error(program, err, None))?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::String(format!("{program} failed with {status}")))
    }
}
