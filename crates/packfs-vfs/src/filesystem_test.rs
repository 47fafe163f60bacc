// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use fuser::FileType;
use nix::errno::Errno;
use packfs::content::{ContentEntry, ContentSource, EntryKind, Metadata};
use relative_path::{RelativePath, RelativePathBuf};
use rstest::rstest;

use super::{BLOCK_SIZE, Filesystem, NodeKind, ROOT_INODE};
use crate::Config;

const MTIME: u64 = 1_600_000_000;

/// An in-memory source that counts how often it is asked for content
#[derive(Debug, Default)]
struct CountingSource {
    entries: BTreeMap<String, Option<Bytes>>,
    broken: Vec<String>,
    stats: AtomicUsize,
    reads: AtomicUsize,
}

impl CountingSource {
    fn file(mut self, path: &str, data: &'static [u8]) -> Self {
        self.entries
            .insert(path.to_string(), Some(Bytes::from_static(data)));
        self
    }

    fn dir(mut self, path: &str) -> Self {
        self.entries.insert(path.to_string(), None);
        self
    }

    /// A file that is listed but cannot be opened
    fn broken(mut self, path: &str) -> Self {
        self.entries
            .insert(path.to_string(), Some(Bytes::from_static(b"???")));
        self.broken.push(path.to_string());
        self
    }

    fn metadata(&self, size: u64) -> Metadata {
        Metadata {
            size,
            mode: 0o100644,
            mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(MTIME),
        }
    }

    fn lookup(&self, path: &RelativePath) -> packfs::Result<&Bytes> {
        if self.broken.iter().any(|b| b == path.as_str()) {
            return Err(packfs::Error::ContentReadError(
                path.to_owned(),
                std::io::Error::other("disk on fire"),
            ));
        }
        match self.entries.get(path.as_str()) {
            Some(Some(data)) => Ok(data),
            _ => Err(packfs::Error::ContentNotFound(path.to_owned())),
        }
    }
}

impl ContentSource for CountingSource {
    fn entries(&self) -> packfs::Result<Vec<ContentEntry>> {
        Ok(self
            .entries
            .iter()
            .map(|(path, data)| ContentEntry {
                path: RelativePathBuf::from(path.as_str()),
                kind: match data {
                    Some(_) => EntryKind::File,
                    None => EntryKind::Directory,
                },
                metadata: self.metadata(data.as_ref().map(|d| d.len() as u64).unwrap_or(0)),
            })
            .collect())
    }

    fn stat(&self, path: &RelativePath) -> packfs::Result<Metadata> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        self.lookup(path).map(|d| self.metadata(d.len() as u64))
    }

    fn read(&self, path: &RelativePath) -> packfs::Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.lookup(path).cloned()
    }
}

fn test_config() -> Config {
    Config::for_mount("packfs-test", 0o555)
}

fn build(source: CountingSource) -> (Arc<CountingSource>, Filesystem) {
    let source = Arc::new(source);
    let fs = Filesystem::build(Arc::clone(&source) as Arc<dyn ContentSource>, test_config())
        .expect("tree should build");
    (source, fs)
}

/// Resolve a slash separated path to its inode
fn resolve(fs: &Filesystem, path: &str) -> u64 {
    path.split('/').fold(ROOT_INODE, |parent, name| {
        fs.lookup(parent, name)
            .unwrap_or_else(|err| panic!("{path} should exist: {err}"))
            .ino
    })
}

#[rstest]
fn test_directories_are_created_once() {
    let (_, fs) = build(
        CountingSource::default()
            .file("a/b/c.txt", b"hello")
            .file("a/d.txt", b"world!"),
    );
    // root, a, a/b and two files
    assert_eq!(fs.len(), 5);
    let dirs = fs
        .nodes
        .iter()
        .filter(|n| n.is_dir() && n.ino != ROOT_INODE)
        .count();
    assert_eq!(dirs, 2);

    let a = resolve(&fs, "a");
    let NodeKind::Directory(children) = &fs.node(a).unwrap().kind else {
        panic!("a should be a directory");
    };
    assert_eq!(
        children.keys().collect::<Vec<_>>(),
        vec!["b", "d.txt"],
        "a should hold exactly one b"
    );
    assert_eq!(fs.lookup(ROOT_INODE, "a").unwrap().kind, FileType::Directory);
    assert_eq!(
        fs.lookup(resolve(&fs, "a/b"), "c.txt").unwrap().kind,
        FileType::RegularFile
    );
}

#[rstest]
fn test_listed_directories_are_merged() {
    let (_, fs) = build(
        CountingSource::default()
            .dir("a")
            .dir("a/empty")
            .file("a/f", b"f"),
    );
    assert_eq!(fs.len(), 4);
    let empty = resolve(&fs, "a/empty");
    assert_eq!(fs.attr(empty).unwrap().size, 0);
}

#[rstest]
fn test_file_below_file_is_skipped() {
    let (_, fs) = build(
        CountingSource::default()
            .file("a", b"i am a file")
            .file("a/b", b"nope"),
    );
    assert_eq!(fs.len(), 2);
    assert_eq!(fs.lookup(resolve(&fs, "a"), "b").err(), Some(Errno::ENOTDIR));
}

#[rstest]
fn test_file_attributes() {
    let data = vec![b'x'; 1025].leak();
    let (source, fs) = build(CountingSource::default().file("big.bin", data));
    let ino = resolve(&fs, "big.bin");
    let attr = fs.attr(ino).unwrap();
    assert_eq!(attr.size, 1025);
    assert_eq!(attr.blocks, 3);
    assert_eq!(attr.blksize, BLOCK_SIZE);
    assert_eq!(attr.nlink, 1);
    assert_eq!(attr.perm, 0o644);
    assert_eq!(attr.kind, FileType::RegularFile);
    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(MTIME);
    assert_eq!(attr.mtime, mtime);
    assert_eq!(attr.atime, mtime);
    assert_eq!(attr.ctime, mtime);
    assert_eq!(attr.uid, nix::unistd::geteuid().as_raw());
    // metadata is loaded once, no matter how often it is requested
    fs.attr(ino).unwrap();
    assert_eq!(source.stats.load(Ordering::SeqCst), 1);
    assert_eq!(source.reads.load(Ordering::SeqCst), 0);
}

#[rstest]
fn test_directory_attributes() {
    let (_, fs) = build(
        CountingSource::default()
            .file("one", b"1")
            .file("two", b"2")
            .dir("three"),
    );
    let attr = fs.attr(ROOT_INODE).unwrap();
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.perm, 0o555);
    assert_eq!(attr.nlink, 2);
    assert_eq!(attr.size, 3);
    assert_eq!(fs.attr(999).err(), Some(Errno::ENOENT));
}

#[rstest]
fn test_read_whole_file_is_cached() {
    let (source, fs) = build(CountingSource::default().file("data.txt", b"0123456789"));
    let ino = resolve(&fs, "data.txt");
    fs.open(ino, libc::O_RDONLY).unwrap();

    let first = fs.read(ino, 0, 4096).unwrap();
    assert_eq!(&first[..], b"0123456789");
    let second = fs.read(ino, 0, 4096).unwrap();
    assert_eq!(first.as_ptr(), second.as_ptr(), "should share one buffer");
    assert_eq!(source.reads.load(Ordering::SeqCst), 1);

    let NodeKind::File(file) = &fs.node(ino).unwrap().kind else {
        panic!("expected a file");
    };
    assert!(file.is_opened());
    assert_eq!(file.loaded().map(|b| b.len()), Some(10));
}

#[rstest]
fn test_concurrent_reads_load_once() {
    let (source, fs) = build(CountingSource::default().file("shared", b"shared content"));
    let fs = Arc::new(fs);
    let ino = resolve(&fs, "shared");
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let fs = Arc::clone(&fs);
            std::thread::spawn(move || fs.read(ino, 0, 64).unwrap())
        })
        .collect();
    for thread in threads {
        assert_eq!(&thread.join().unwrap()[..], b"shared content");
    }
    assert_eq!(source.reads.load(Ordering::SeqCst), 1);
}

#[rstest]
#[case(0, 4, b"0123".as_slice())]
#[case(8, 100, b"89".as_slice())]
#[case(10, 4, b"".as_slice())]
#[case(500, 4, b"".as_slice())]
fn test_read_is_clipped(#[case] offset: i64, #[case] size: u32, #[case] expected: &[u8]) {
    let (_, fs) = build(CountingSource::default().file("data.txt", b"0123456789"));
    let ino = resolve(&fs, "data.txt");
    assert_eq!(&fs.read(ino, offset, size).unwrap()[..], expected);
}

#[rstest]
fn test_read_errors() {
    let (_, fs) = build(CountingSource::default().file("data.txt", b"abc").dir("d"));
    let ino = resolve(&fs, "data.txt");
    assert_eq!(fs.read(ino, -1, 4), Err(Errno::EINVAL));
    assert_eq!(fs.read(resolve(&fs, "d"), 0, 4), Err(Errno::EISDIR));
}

#[rstest]
fn test_open_errors() {
    let (_, fs) = build(
        CountingSource::default()
            .file("ok", b"ok")
            .broken("bad")
            .dir("d"),
    );
    let ok = resolve(&fs, "ok");
    assert_eq!(fs.open(ok, libc::O_WRONLY), Err(Errno::EROFS));
    assert_eq!(fs.open(ok, libc::O_RDWR), Err(Errno::EROFS));
    assert_eq!(fs.open(resolve(&fs, "d"), libc::O_RDONLY), Err(Errno::EISDIR));
    assert_eq!(fs.open(12345, libc::O_RDONLY), Err(Errno::ENOENT));

    // the failure is per request, the tree stays usable
    let bad = fs.lookup(ROOT_INODE, "bad");
    assert_eq!(bad.err(), Some(Errno::EIO));
    assert_eq!(fs.open(ok, libc::O_RDONLY), Ok(()));
}

#[rstest]
fn test_lookup_errors() {
    let (_, fs) = build(CountingSource::default().file("f", b"f"));
    assert_eq!(fs.lookup(ROOT_INODE, "missing").err(), Some(Errno::ENOENT));
    assert_eq!(fs.lookup(resolve(&fs, "f"), "x").err(), Some(Errno::ENOTDIR));
    assert_eq!(fs.opendir(resolve(&fs, "f")), Err(Errno::ENOTDIR));
    assert_eq!(fs.opendir(ROOT_INODE), Ok(()));
}

#[rstest]
fn test_lookup_non_utf8_name_is_not_found() {
    let (_, fs) = build(CountingSource::default().file("f", b"f"));
    let name = OsStr::from_bytes(b"f\xff");
    assert_eq!(fs.lookup(ROOT_INODE, name).err(), Some(Errno::ENOENT));
    assert!(fs.lookup(ROOT_INODE, OsStr::new("f")).is_ok());
}

#[rstest]
fn test_readdir_offsets() {
    let (_, fs) = build(
        CountingSource::default()
            .file("zeta", b"z")
            .file("alpha", b"a")
            .dir("mid"),
    );
    let listing = fs.readdir(ROOT_INODE, 0).unwrap();
    let names: Vec<_> = listing.iter().map(|e| e.3.as_str()).collect();
    assert_eq!(names, vec![".", "..", "alpha", "mid", "zeta"]);
    let offsets: Vec<_> = listing.iter().map(|e| e.1).collect();
    assert_eq!(offsets, vec![1, 2, 3, 4, 5]);
    assert_eq!(listing[0].0, ROOT_INODE);
    assert_eq!(listing[3].2, FileType::Directory);

    let rest = fs.readdir(ROOT_INODE, 3).unwrap();
    let names: Vec<_> = rest.iter().map(|e| e.3.as_str()).collect();
    assert_eq!(names, vec!["mid", "zeta"]);
    assert!(fs.readdir(ROOT_INODE, 5).unwrap().is_empty());

    let mid = resolve(&fs, "mid");
    let listing = fs.readdir(mid, 0).unwrap();
    assert_eq!(listing[1].0, ROOT_INODE, "parent of mid is the root");
}

#[rstest]
fn test_statfs() {
    let data = vec![b'x'; 513].leak();
    let (source, fs) = build(
        CountingSource::default()
            .file("a", b"a")
            .file("dir/b", data),
    );
    let stats = fs.statfs();
    assert_eq!(stats.files, 4);
    assert_eq!(stats.blocks, 1 + 2);
    // totals never load any content
    assert_eq!(source.stats.load(Ordering::SeqCst), 0);
}
