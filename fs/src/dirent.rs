//! Directory entries and the filesystem contract.
//!
//! A [`Dirent`] is the currency of every mounted backend: it names an
//! object inside one filesystem and knows enough (first block, parent,
//! size) for the backend to read it without re-resolving the path.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    NotDir,
    NotFile,
    IoError,
    InvalidPath,
    NoSpace,
    NotEmpty,
    AlreadyExists,
    Unsupported,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotFound => "no such file or directory",
            Self::NotDir => "not a directory",
            Self::NotFile => "not a file",
            Self::IoError => "I/O error",
            Self::InvalidPath => "invalid path",
            Self::NoSpace => "no space left",
            Self::NotEmpty => "directory not empty",
            Self::AlreadyExists => "already exists",
            Self::Unsupported => "operation not supported",
        };
        write!(f, "{}", text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntType {
    File,
    Dir,
    VolumeId,
    Invalid,
}

/// Completion delegate for asynchronous reads.
pub type OnReadFn = fn(Result<Vec<u8>, FsError>);

/// A resolved entry inside one mounted filesystem.
#[derive(Clone)]
pub struct Dirent {
    pub fs: &'static dyn FileSystem,
    pub name: String,
    pub kind: EntType,
    /// First data block / cluster of the object.
    pub block: u64,
    /// Block of the containing directory.
    pub parent: u64,
    pub size: u64,
}

impl Dirent {
    pub fn is_dir(&self) -> bool {
        self.kind == EntType::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntType::File
    }

    /// Synchronous read of `n` bytes at `pos`.
    pub fn read(&self, pos: u64, n: u64) -> Result<Vec<u8>, FsError> {
        self.fs.read(self, pos, n)
    }

    /// Asynchronous read; the delegate fires on completion.
    pub fn read_async(&self, pos: u64, n: u64, on_read: OnReadFn) {
        self.fs.read_async(self, pos, n, on_read);
    }

    /// List a directory's entries.
    pub fn ls(&self) -> Result<Vec<Dirent>, FsError> {
        self.fs.ls(self)
    }

    /// Resolve `path` relative to this entry.
    pub fn stat(&self, path: &str) -> Result<Dirent, FsError> {
        self.fs.stat_from(self, path)
    }
}

impl fmt::Debug for Dirent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {} bytes, block {})",
            self.name, self.kind, self.size, self.block
        )
    }
}

/// Contract every mounted backend implements (spec'd by the VFS seam):
/// path resolution, listing, and reads — synchronous and delegate-driven.
pub trait FileSystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// The filesystem's root directory entry.
    fn root(&'static self) -> Dirent;

    /// Resolve an absolute (fs-relative) path.
    fn stat(&'static self, path: &str) -> Result<Dirent, FsError>;

    /// Resolve `path` relative to `from`.
    fn stat_from(&self, from: &Dirent, path: &str) -> Result<Dirent, FsError>;

    /// List a directory.
    fn ls(&self, dirent: &Dirent) -> Result<Vec<Dirent>, FsError>;

    /// Read `n` bytes at `pos` from a file.
    fn read(&self, dirent: &Dirent, pos: u64, n: u64) -> Result<Vec<u8>, FsError>;

    /// Delegate-driven read. In-memory backends complete inline; a driver
    /// backed by a real controller completes from its ISR.
    fn read_async(&self, dirent: &Dirent, pos: u64, n: u64, on_read: OnReadFn) {
        on_read(self.read(dirent, pos, n));
    }
}

/// Split a path into components, ignoring empty segments.
pub fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}
