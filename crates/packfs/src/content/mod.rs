// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

//! Read-only, hierarchical byte stores that back a mount.

mod directory;
mod subtree;
mod tar;

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use relative_path::{RelativePath, RelativePathBuf};

pub use self::directory::DirectorySource;
pub use self::subtree::Subtree;
pub use self::tar::TarSource;
use crate::{Error, Result};


/// The kind of item found in a content source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    Directory,
    File,
}

impl EntryKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File)
    }
}

/// Describes the size, permissions and age of one item.
///
/// Content sources only track a single timestamp, which
/// is reported for access, change and modification alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub size: u64,
    pub mode: u32,
    pub mtime: SystemTime,
}

/// One item found while walking a content source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub path: RelativePathBuf,
    pub kind: EntryKind,
    pub metadata: Metadata,
}

impl ContentEntry {
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// An immutable tree of files that can be presented in a mount.
///
/// Paths are always relative and slash-separated. Content is
/// expected to never change while a source is in use, so callers
/// are free to cache anything they read.
pub trait ContentSource: std::fmt::Debug + Send + Sync {
    /// List every directory and file in this source, in no particular order
    fn entries(&self) -> Result<Vec<ContentEntry>>;

    /// Load the metadata for a single file
    fn stat(&self, path: &RelativePath) -> Result<Metadata>;

    /// Load the entire contents of a single file
    fn read(&self, path: &RelativePath) -> Result<Bytes>;
}

impl<T: ContentSource + ?Sized> ContentSource for Arc<T> {
    fn entries(&self) -> Result<Vec<ContentEntry>> {
        (**self).entries()
    }

    fn stat(&self, path: &RelativePath) -> Result<Metadata> {
        (**self).stat(path)
    }

    fn read(&self, path: &RelativePath) -> Result<Bytes> {
        (**self).read(path)
    }
}

/// Open the bundle at the given path, which can either be
/// a directory on disk or a tar archive.
pub fn open_bundle<P: AsRef<Path>>(path: P) -> Result<Arc<dyn ContentSource>> {
    let path = path.as_ref();
    let meta =
        std::fs::metadata(path).map_err(|err| Error::BundleOpenError(path.to_owned(), err))?;
    if meta.is_dir() {
        tracing::debug!(?path, "opening bundle directory");
        Ok(Arc::new(DirectorySource::new(path)))
    } else {
        tracing::debug!(?path, "opening bundle archive");
        Ok(Arc::new(TarSource::open(path)?))
    }
}

/// Normalize a path as it appears in an archive or listing into
/// the relative form used by content sources.
///
/// Returns None for paths that would escape the root of the source.
pub(crate) fn clean_path(path: &str) -> Option<RelativePathBuf> {
    let path = RelativePathBuf::from(path.trim_start_matches('/')).normalize();
    match path.components().next() {
        Some(relative_path::Component::ParentDir) => None,
        _ => Some(path),
    }
}
