// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use fuser::{FileAttr, FileType};
use nix::errno::Errno;
use once_cell::sync::OnceCell;
use packfs::content::{ContentSource, EntryKind, Metadata};
use relative_path::{Component, RelativePath, RelativePathBuf};

use crate::Config;

#[cfg(test)]
#[path = "./filesystem_test.rs"]
mod filesystem_test;

/// The inode of the root directory of every filesystem
pub const ROOT_INODE: u64 = 1;

/// The block size reported for all files.
///
/// The content does not live on any one disk, so this is simply
/// a realistic value for commands like du to work with.
pub const BLOCK_SIZE: u32 = 512;

/// A file in the filesystem and its lazily loaded content.
///
/// A file starts out unopened. Its metadata is loaded when first
/// touched, and its full content is loaded on first read. Each step
/// happens at most once, even when raced, and is never undone.
#[derive(Debug)]
pub struct FileNode {
    path: RelativePathBuf,
    listed_size: u64,
    metadata: OnceCell<Metadata>,
    data: OnceCell<Bytes>,
}

impl FileNode {
    fn new(path: RelativePathBuf, listed_size: u64) -> Self {
        Self {
            path,
            listed_size,
            metadata: OnceCell::new(),
            data: OnceCell::new(),
        }
    }

    /// The location of this file in its content source
    pub fn path(&self) -> &RelativePath {
        &self.path
    }

    /// True once the metadata for this file has been loaded
    pub fn is_opened(&self) -> bool {
        self.metadata.get().is_some()
    }

    /// The content of this file, if it has been loaded
    pub fn loaded(&self) -> Option<&Bytes> {
        self.data.get()
    }

    fn metadata(&self, source: &dyn ContentSource) -> Result<&Metadata, Errno> {
        self.metadata.get_or_try_init(|| {
            source.stat(&self.path).map_err(|err| {
                tracing::error!(path = %self.path, "{}", packfs::describe_chain(&err));
                Errno::EIO
            })
        })
    }

    fn data(&self, source: &dyn ContentSource) -> Result<&Bytes, Errno> {
        self.data.get_or_try_init(|| {
            tracing::trace!(path = %self.path, "loading file content");
            source.read(&self.path).map_err(|err| {
                tracing::error!(path = %self.path, "{}", packfs::describe_chain(&err));
                Errno::EIO
            })
        })
    }
}

/// What a node in the filesystem represents
#[derive(Debug)]
pub enum NodeKind {
    /// A directory, mapping each child name to its inode
    Directory(BTreeMap<String, u64>),
    /// A regular file
    File(FileNode),
}

/// One inode in the filesystem
#[derive(Debug)]
pub struct Node {
    /// The inode number of this node
    pub ino: u64,
    /// The inode of the directory holding this node
    pub parent: u64,
    /// The contents of this node
    pub kind: NodeKind,
}

impl Node {
    /// True if this node is a directory
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    fn file_type(&self) -> FileType {
        match self.kind {
            NodeKind::Directory(_) => FileType::Directory,
            NodeKind::File(_) => FileType::RegularFile,
        }
    }
}

/// Totals reported for the whole filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    /// Blocks used by all files, as listed by the content source
    pub blocks: u64,
    /// The number of inodes in use
    pub files: u64,
}

/// An immutable tree of inodes over a content source.
///
/// The tree is built once, up front, and only the per-file
/// content cells change afterwards.
#[derive(Debug)]
pub struct Filesystem {
    source: Arc<dyn ContentSource>,
    opts: Config,
    created: SystemTime,
    nodes: Vec<Node>,
}

impl Filesystem {
    /// Walk the given source and allocate an inode for everything in it
    pub fn build(source: Arc<dyn ContentSource>, opts: Config) -> crate::Result<Self> {
        let mut entries = source.entries()?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let mut fs = Self {
            source,
            opts,
            created: SystemTime::now(),
            nodes: vec![Node {
                ino: ROOT_INODE,
                parent: ROOT_INODE,
                kind: NodeKind::Directory(BTreeMap::new()),
            }],
        };
        for entry in entries {
            if let Err(errno) = fs.insert(&entry.path, entry.kind, entry.metadata.size) {
                tracing::warn!(path = %entry.path, %errno, "skipping content that does not fit in the tree");
            }
        }
        tracing::debug!(inodes = fs.nodes.len(), "filesystem tree built");
        Ok(fs)
    }

    /// The options that this filesystem was built with
    pub fn config(&self) -> &Config {
        &self.opts
    }

    /// Get a node by its inode number
    pub fn node(&self, ino: u64) -> Option<&Node> {
        let index = ino.checked_sub(1)?;
        self.nodes.get(usize::try_from(index).ok()?)
    }

    /// The number of inodes in this filesystem
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the filesystem holds nothing but its root
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    fn get(&self, ino: u64) -> Result<&Node, Errno> {
        self.node(ino).ok_or(Errno::ENOENT)
    }

    fn insert(&mut self, path: &RelativePath, kind: EntryKind, size: u64) -> Result<u64, Errno> {
        let names: Vec<&str> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name),
                _ => None,
            })
            .collect();
        let Some((base, dirs)) = names.split_last() else {
            return Ok(ROOT_INODE);
        };
        let mut parent = ROOT_INODE;
        for dir in dirs {
            parent = self.directory(parent, dir)?;
        }
        match kind {
            EntryKind::Directory => self.directory(parent, base),
            EntryKind::File => self.file(parent, base, path, size),
        }
    }

    fn children_mut(&mut self, ino: u64) -> Result<&mut BTreeMap<String, u64>, Errno> {
        let index = ino
            .checked_sub(1)
            .and_then(|i| usize::try_from(i).ok())
            .ok_or(Errno::ENOENT)?;
        match self.nodes.get_mut(index).map(|n| &mut n.kind) {
            Some(NodeKind::Directory(children)) => Ok(children),
            Some(NodeKind::File(_)) => Err(Errno::ENOTDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn push(&mut self, parent: u64, name: &str, kind: NodeKind) -> Result<u64, Errno> {
        let ino = self.nodes.len() as u64 + 1;
        self.children_mut(parent)?.insert(name.to_owned(), ino);
        self.nodes.push(Node { ino, parent, kind });
        Ok(ino)
    }

    /// Find or create the named directory under parent
    fn directory(&mut self, parent: u64, name: &str) -> Result<u64, Errno> {
        if let Some(&ino) = self.children_mut(parent)?.get(name) {
            return match self.get(ino)?.is_dir() {
                true => Ok(ino),
                false => Err(Errno::ENOTDIR),
            };
        }
        self.push(parent, name, NodeKind::Directory(BTreeMap::new()))
    }

    fn file(&mut self, parent: u64, name: &str, path: &RelativePath, size: u64) -> Result<u64, Errno> {
        if self.children_mut(parent)?.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        let node = FileNode::new(path.normalize(), size);
        self.push(parent, name, NodeKind::File(node))
    }

    /// The attributes of a node, opening it first if needed
    pub fn attr(&self, ino: u64) -> Result<FileAttr, Errno> {
        let node = self.get(ino)?;
        let (size, perm, mtime, nlink, blocks) = match &node.kind {
            NodeKind::Directory(children) => {
                let size = children.len() as u64;
                (size, self.opts.root_mode, self.created, 2, 0)
            }
            NodeKind::File(file) => {
                let meta = file.metadata(&*self.source)?;
                let blocks = meta.size.div_ceil(BLOCK_SIZE as u64);
                (meta.size, meta.mode, meta.mtime, 1, blocks)
            }
        };
        Ok(FileAttr {
            ino: node.ino,
            size,
            blocks,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: node.file_type(),
            perm: (perm & 0o7777) as u16,
            nlink,
            uid: self.opts.uid.as_raw(),
            gid: self.opts.gid.as_raw(),
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        })
    }

    /// Find a named child of a directory
    pub fn lookup<N: AsRef<OsStr>>(&self, parent: u64, name: N) -> Result<FileAttr, Errno> {
        let NodeKind::Directory(children) = &self.get(parent)?.kind else {
            return Err(Errno::ENOTDIR);
        };
        // every name in the tree is valid utf-8
        let name = name.as_ref().to_str().ok_or(Errno::ENOENT)?;
        let ino = *children.get(name).ok_or(Errno::ENOENT)?;
        self.attr(ino)
    }

    /// Prepare a file for reading
    pub fn open(&self, ino: u64, flags: i32) -> Result<(), Errno> {
        let node = self.get(ino)?;
        if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
            return Err(Errno::EROFS);
        }
        match &node.kind {
            NodeKind::Directory(_) => Err(Errno::EISDIR),
            NodeKind::File(file) => file.metadata(&*self.source).map(|_| ()),
        }
    }

    /// Read part of a file, loading the whole file on first use.
    ///
    /// The result is clipped to the end of the file.
    pub fn read(&self, ino: u64, offset: i64, size: u32) -> Result<Bytes, Errno> {
        let offset = u64::try_from(offset).map_err(|_| Errno::EINVAL)?;
        let NodeKind::File(file) = &self.get(ino)?.kind else {
            return Err(Errno::EISDIR);
        };
        let data = file.data(&*self.source)?;
        let len = data.len() as u64;
        let start = offset.min(len);
        let end = start.saturating_add(size as u64).min(len);
        Ok(data.slice(start as usize..end as usize))
    }

    /// Prepare a directory for listing
    pub fn opendir(&self, ino: u64) -> Result<(), Errno> {
        match self.get(ino)?.is_dir() {
            true => Ok(()),
            false => Err(Errno::ENOTDIR),
        }
    }

    /// List a directory, starting after the given offset.
    ///
    /// Each item carries its own offset, which is its one-based
    /// position in the listing.
    pub fn readdir(&self, ino: u64, offset: i64) -> Result<Vec<(u64, i64, FileType, String)>, Errno> {
        let node = self.get(ino)?;
        let NodeKind::Directory(children) = &node.kind else {
            return Err(Errno::ENOTDIR);
        };
        let skip = usize::try_from(offset).map_err(|_| Errno::EINVAL)?;
        let dots = [
            (node.ino, FileType::Directory, ".".to_string()),
            (node.parent, FileType::Directory, "..".to_string()),
        ];
        let children = children.iter().filter_map(|(name, &child)| {
            let kind = self.node(child)?.file_type();
            Some((child, kind, name.clone()))
        });
        Ok(dots
            .into_iter()
            .chain(children)
            .enumerate()
            .skip(skip)
            .map(|(i, (ino, kind, name))| (ino, i as i64 + 1, kind, name))
            .collect())
    }

    /// Totals for the whole filesystem
    pub fn statfs(&self) -> StatFs {
        let blocks = self
            .nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::File(file) => Some(file.listed_size.div_ceil(BLOCK_SIZE as u64)),
                NodeKind::Directory(_) => None,
            })
            .sum();
        StatFs {
            blocks,
            files: self.nodes.len() as u64,
        }
    }
}
