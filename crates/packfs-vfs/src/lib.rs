// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

//! Virtual filesystem for packfs content
//!
//! Presents any [`packfs::content::ContentSource`] as a
//! read-only FUSE filesystem.

#![deny(missing_docs)]

mod error;
mod filesystem;
mod fuse;

pub use error::Error;
pub use filesystem::{BLOCK_SIZE, FileNode, Filesystem, Node, NodeKind, ROOT_INODE, StatFs};
pub use fuse::{Config, Session, mount};

/// A result whose error is specific to the virtual filesystem
pub type Result<T> = std::result::Result<T, Error>;
