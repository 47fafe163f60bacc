// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use bytes::Bytes;
use relative_path::{RelativePath, RelativePathBuf};

use super::{ContentEntry, ContentSource, Metadata};
use crate::Result;

/// Presents a single directory of another content source as its own root.
#[derive(Debug, Clone)]
pub struct Subtree {
    inner: Arc<dyn ContentSource>,
    prefix: RelativePathBuf,
}

impl Subtree {
    pub fn new<P: AsRef<RelativePath>>(inner: Arc<dyn ContentSource>, prefix: P) -> Self {
        Self {
            inner,
            prefix: prefix.as_ref().normalize(),
        }
    }

    pub fn prefix(&self) -> &RelativePath {
        &self.prefix
    }
}

impl ContentSource for Subtree {
    fn entries(&self) -> Result<Vec<ContentEntry>> {
        let entries = self.inner.entries()?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let path = entry.path.strip_prefix(&self.prefix).ok()?.to_owned();
                if path.as_str().is_empty() {
                    // the prefix directory itself becomes the root
                    return None;
                }
                Some(ContentEntry { path, ..entry })
            })
            .collect())
    }

    fn stat(&self, path: &RelativePath) -> Result<Metadata> {
        self.inner.stat(&self.prefix.join(path))
    }

    fn read(&self, path: &RelativePath) -> Result<Bytes> {
        self.inner.read(&self.prefix.join(path))
    }
}
