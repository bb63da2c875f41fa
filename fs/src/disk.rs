//! Block devices.
//!
//! The filesystem drivers read through this seam; the real virtio-blk
//! driver lives outside this crate and implements the same trait. The
//! in-RAM implementation backs boot images and the test suites.

extern crate alloc;

use alloc::vec::Vec;

/// Sector size every driver in this tree speaks.
pub const BLOCK_SIZE: usize = 512;

pub trait BlockDevice: Send + Sync {
    /// Total capacity in blocks.
    fn size_blocks(&self) -> u64;

    /// Read `count` blocks starting at `lba`. `None` past the end.
    fn read(&self, lba: u64, count: usize) -> Option<Vec<u8>>;

    fn device_name(&self) -> &'static str {
        "disk"
    }
}

/// A disk pinned in memory — the classic unikernel boot medium: the image
/// is linked into (or loaded beside) the binary and never changes.
pub struct MemDisk {
    data: &'static [u8],
}

impl MemDisk {
    pub const fn new(data: &'static [u8]) -> Self {
        Self { data }
    }
}

impl BlockDevice for MemDisk {
    fn size_blocks(&self) -> u64 {
        (self.data.len() / BLOCK_SIZE) as u64
    }

    fn read(&self, lba: u64, count: usize) -> Option<Vec<u8>> {
        let start = (lba as usize).checked_mul(BLOCK_SIZE)?;
        let end = start.checked_add(count.checked_mul(BLOCK_SIZE)?)?;
        if end > self.data.len() {
            return None;
        }
        Some(self.data[start..end].to_vec())
    }

    fn device_name(&self) -> &'static str {
        "memdisk"
    }
}
