#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

//! Filesystems: the typed VFS mount tree, a read-only FAT driver, the
//! in-memory filesystem, and the block-device seam between them.

extern crate alloc;

pub mod dirent;
pub mod disk;
pub mod fat;
pub mod memfs;
pub mod vfs;

pub mod fat_tests;
pub mod memfs_tests;
pub mod vfs_tests;

pub use dirent::{Dirent, EntType, FileSystem, FsError};
pub use disk::{BlockDevice, MemDisk};
pub use vfs::{VfsError, mount, mount_mut, get, get_mut, stat_path, read_path};
