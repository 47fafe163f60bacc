// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fuser::consts::*;
use fuser::{MountOption, ReplyData, ReplyDirectory, ReplyEntry, ReplyOpen, Request};
use tokio::task::JoinHandle;

use crate::Filesystem;

#[cfg(test)]
#[path = "./fuse_test.rs"]
mod fuse_test;

/// Kernel capabilities requested during init, by name
const DESIRED_CAPABILITIES: &[(&str, u64)] = &[
    ("FUSE_ASYNC_READ", FUSE_ASYNC_READ),
    ("FUSE_EXPORT_SUPPORT", FUSE_EXPORT_SUPPORT),
];

fn desired_capabilities() -> u64 {
    DESIRED_CAPABILITIES
        .iter()
        .fold(0, |prev, (_, flag)| prev | flag)
}

/// The names of desired capabilities that the kernel refused
fn rejected_capabilities(unsupported: u64) -> impl Iterator<Item = &'static str> {
    DESIRED_CAPABILITIES
        .iter()
        .filter_map(move |(name, flag)| (flag & unsupported != 0).then_some(*name))
}

/// Options to configure the FUSE filesystem and
/// its behavior at runtime
#[derive(Debug, Clone)]
pub struct Config {
    /// The permission bits reported for every directory
    pub root_mode: u32,
    /// The user id that should own all files and directories
    pub uid: nix::unistd::Uid,
    /// The group id that should own all files and directories
    pub gid: nix::unistd::Gid,
    /// Mount options to be used when setting up
    pub mount_options: HashSet<MountOption>,
}

impl Config {
    /// The standard read-only configuration for a named mount,
    /// owned by the calling user
    pub fn for_mount(fs_name: &str, root_mode: u32) -> Self {
        let mount_options = [
            MountOption::RO,
            MountOption::NoDev,
            MountOption::NoSuid,
            MountOption::FSName(fs_name.to_string()),
            MountOption::Subtype("packfs".to_string()),
        ];
        Self {
            root_mode,
            uid: nix::unistd::geteuid(),
            gid: nix::unistd::getegid(),
            mount_options: mount_options.into_iter().collect(),
        }
    }
}

/// Extract the ok value from a result, or reply with an error in FUSE
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error to FUSE and return
macro_rules! err {
    ($reply:ident, $errno:expr) => {{
        let errno: nix::errno::Errno = $errno;
        tracing::trace!("{errno}");
        $reply.error(errno as i32);
        return;
    }};
}

/// Represents a connected FUSE session.
///
/// This implements the [`fuser::Filesystem`] trait, receives
/// all requests and arranges for their execution on the tokio
/// runtime. Requests that may need to load content from the
/// source run as blocking tasks.
pub struct Session {
    fs: Arc<Filesystem>,
    ttl: Duration,
}

impl Session {
    /// Construct a new session which serves the provided filesystem
    pub fn new(fs: Filesystem) -> Self {
        Self {
            fs: Arc::new(fs),
            // content never changes while mounted
            ttl: Duration::from_secs(u64::MAX),
        }
    }
}

impl fuser::Filesystem for Session {
    fn init(
        &mut self,
        _req: &Request<'_>,
        config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        let all_desired = desired_capabilities();
        if let Err(unsupported) = config.add_capabilities(all_desired) {
            for name in rejected_capabilities(unsupported) {
                tracing::warn!("FUSE feature rejected: {name}");
            }
            if config.add_capabilities(all_desired & !unsupported).is_err() {
                tracing::warn!("FUSE capabilities were not accepted");
            }
        }
        tracing::info!("Filesystem initialized");
        Ok(())
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move {
            let stats = fs.statfs();
            reply.statfs(
                stats.blocks,
                0,
                0,
                stats.files,
                0,
                crate::BLOCK_SIZE,
                u32::MAX,
                crate::BLOCK_SIZE,
            )
        });
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.fs);
        let ttl = self.ttl;
        tokio::task::spawn_blocking(move || {
            tracing::trace!("lookup {name:?} in {parent}");
            let attr = unwrap!(reply, fs.lookup(parent, &name));
            reply.entry(&ttl, &attr, 0);
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: fuser::ReplyAttr) {
        let fs = Arc::clone(&self.fs);
        let ttl = self.ttl;
        tokio::task::spawn_blocking(move || {
            let attr = unwrap!(reply, fs.attr(ino));
            reply.attr(&ttl, &attr);
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn_blocking(move || {
            unwrap!(reply, fs.open(ino, flags));
            tracing::trace!("open {ino}");
            // no handles are allocated, reads go straight to the inode
            reply.opened(0, FOPEN_KEEP_CACHE);
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn_blocking(move || {
            let data = unwrap!(reply, fs.read(ino, offset, size));
            tracing::trace!("read {ino} = {}/{size}", data.len());
            reply.data(&data);
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        // ignore flush because we don't support write operations
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move {
            unwrap!(reply, fs.opendir(ino));
            reply.opened(0, 0);
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move {
            let entries = unwrap!(reply, fs.readdir(ino, offset));
            for (ino, next_offset, kind, name) in entries {
                let buffer_full = reply.add(ino, next_offset, kind, name);
                if buffer_full {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }
}

/// Attach a filesystem at the given mount point.
///
/// The returned task serves requests until the filesystem is
/// unmounted, and must be started from within a tokio runtime.
pub fn mount(fs: Filesystem, mountpoint: &Path) -> crate::Result<JoinHandle<std::io::Result<()>>> {
    let mount_opts = fs.config().mount_options.iter().cloned().collect::<Vec<_>>();
    tracing::debug!(?mountpoint, ?mount_opts, "Establishing fuse session...");
    let mut session = fuser::Session::new(Session::new(fs), mountpoint, &mount_opts)
        .map_err(|err| crate::Error::Mount(mountpoint.to_owned(), err))?;
    // the session blocks its thread while serving, so it
    // is given to tokio as a blocking task to schedule
    Ok(tokio::task::spawn_blocking(move || session.run()))
}
