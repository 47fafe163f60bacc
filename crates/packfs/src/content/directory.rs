// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use relative_path::{RelativePath, RelativePathBuf};

use super::{ContentEntry, ContentSource, EntryKind, Metadata};
use crate::{Error, Result};

/// A content source that reads from a directory on disk.
///
/// The directory is expected to remain unchanged for as long
/// as the source is being used.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn metadata_from_fs(meta: &std::fs::Metadata) -> Metadata {
        Metadata {
            size: meta.len(),
            mode: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }

    fn resolve(&self, path: &RelativePath) -> PathBuf {
        path.normalize().to_path(&self.root)
    }

    fn read_err(path: &RelativePath, err: std::io::Error) -> Error {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::ContentNotFound(path.to_owned()),
            _ => Error::ContentReadError(path.to_owned(), err),
        }
    }
}

impl ContentSource for DirectorySource {
    fn entries(&self) -> Result<Vec<ContentEntry>> {
        let mut entries = Vec::new();
        for item in walkdir::WalkDir::new(&self.root).min_depth(1) {
            let item = item.map_err(|err| {
                let path = err.path().unwrap_or(&self.root).to_owned();
                Error::BundleOpenError(path, err.into())
            })?;
            let file_type = item.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                tracing::debug!(path = ?item.path(), "skipping unsupported file type");
                continue;
            };
            let relative = item
                .path()
                .strip_prefix(&self.root)
                .ok()
                .and_then(|p| RelativePathBuf::from_path(p).ok())
                .ok_or_else(|| Error::InvalidBundlePath(item.path().to_owned()))?;
            let meta = item
                .metadata()
                .map_err(|err| Error::BundleOpenError(item.path().to_owned(), err.into()))?;
            entries.push(ContentEntry {
                path: relative,
                kind,
                metadata: Self::metadata_from_fs(&meta),
            });
        }
        Ok(entries)
    }

    fn stat(&self, path: &RelativePath) -> Result<Metadata> {
        let meta = std::fs::metadata(self.resolve(path)).map_err(|err| Self::read_err(path, err))?;
        if !meta.is_file() {
            return Err(Error::ContentNotFound(path.to_owned()));
        }
        Ok(Self::metadata_from_fs(&meta))
    }

    fn read(&self, path: &RelativePath) -> Result<Bytes> {
        std::fs::read(self.resolve(path))
            .map(Bytes::from)
            .map_err(|err| Self::read_err(path, err))
    }
}
