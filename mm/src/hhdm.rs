//! Physical-memory window.
//!
//! Everything that touches physical frames directly (page-table walks,
//! frame zeroing, allocator metadata) goes through this translation. The
//! offset is zero when physical memory is identity-mapped and is set to
//! the boot loader's higher-half direct-map offset otherwise.

use core::sync::atomic::{AtomicU64, Ordering};

use keel_abi::addr::{PhysAddr, VirtAddr};

static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the linear offset at which physical memory is mapped.
pub fn set_phys_offset(offset: u64) {
    PHYS_OFFSET.store(offset, Ordering::Release);
}

pub fn phys_offset() -> u64 {
    PHYS_OFFSET.load(Ordering::Acquire)
}

/// Linear address through which `phys` can be read and written.
#[inline]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + PHYS_OFFSET.load(Ordering::Acquire))
}
