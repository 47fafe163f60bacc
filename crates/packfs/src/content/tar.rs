// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use relative_path::{RelativePath, RelativePathBuf};

use super::{ContentEntry, ContentSource, EntryKind, Metadata, clean_path};
use crate::{Error, Result};

#[derive(Debug)]
struct Item {
    kind: EntryKind,
    metadata: Metadata,
    data: Bytes,
}

/// A content source backed by a tar archive that is held in memory.
#[derive(Debug, Default)]
pub struct TarSource {
    items: BTreeMap<RelativePathBuf, Item>,
}

impl TarSource {
    /// Load the tar archive at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            std::fs::File::open(path).map_err(|err| Error::BundleOpenError(path.to_owned(), err))?;
        Self::from_reader(std::io::BufReader::new(file))
            .map_err(|err| Error::BundleOpenError(path.to_owned(), err))
    }

    /// Load a tar archive from any stream of bytes.
    ///
    /// Only regular files and directories are retained, other
    /// entry types (links, devices, etc) are skipped.
    pub fn from_reader<R: Read>(reader: R) -> std::io::Result<Self> {
        let mut archive = ::tar::Archive::new(reader);
        let mut items = BTreeMap::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_type = entry.header().entry_type();
            let kind = if entry_type.is_dir() {
                EntryKind::Directory
            } else if entry_type.is_file() {
                EntryKind::File
            } else {
                tracing::debug!(path = ?entry.path(), ?entry_type, "skipping unsupported tar entry");
                continue;
            };
            let raw_path = entry.path()?.to_string_lossy().into_owned();
            let Some(path) = clean_path(&raw_path) else {
                tracing::warn!(path = %raw_path, "skipping tar entry outside of the archive root");
                continue;
            };
            if path.as_str().is_empty() {
                continue;
            }
            let mode = entry.header().mode()? & 0o7777;
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(entry.header().mtime()?);
            let mut data = Vec::new();
            if kind.is_file() {
                entry.read_to_end(&mut data)?;
            }
            let metadata = Metadata {
                size: data.len() as u64,
                mode,
                mtime,
            };
            items.insert(
                path,
                Item {
                    kind,
                    metadata,
                    data: Bytes::from(data),
                },
            );
        }
        tracing::debug!(count = items.len(), "loaded tar archive");
        Ok(Self { items })
    }

    fn get_file(&self, path: &RelativePath) -> Result<&Item> {
        match self.items.get(&path.normalize()) {
            Some(item) if item.kind.is_file() => Ok(item),
            _ => Err(Error::ContentNotFound(path.to_owned())),
        }
    }
}

impl ContentSource for TarSource {
    fn entries(&self) -> Result<Vec<ContentEntry>> {
        Ok(self
            .items
            .iter()
            .map(|(path, item)| ContentEntry {
                path: path.clone(),
                kind: item.kind,
                metadata: item.metadata.clone(),
            })
            .collect())
    }

    fn stat(&self, path: &RelativePath) -> Result<Metadata> {
        self.get_file(path).map(|item| item.metadata.clone())
    }

    fn read(&self, path: &RelativePath) -> Result<Bytes> {
        // cloning the bytes only bumps a reference count
        self.get_file(path).map(|item| item.data.clone())
    }
}
