//! Physical page-frame pool.
//!
//! A buddy allocator with `min_size` = 4 KiB over the largest usable RAM
//! region handed over by the boot loader. The node metadata array is carved
//! from the front of that same region before the pool is created; both the
//! metadata and frame contents are reached through the physical-memory
//! window ([`crate::hhdm`]).

use core::ptr;

use keel_abi::addr::PhysAddr;
use keel_lib::{IrqMutex, align_down_u64, align_up_u64, klog_info};

use crate::buddy::{BuddyAlloc, BuddyNode};
use crate::paging::defs::PAGE_SIZE_4KB;

static FRAME_POOL: IrqMutex<Option<BuddyAlloc>> = IrqMutex::new(None);

/// Initialise the frame pool over `[region_start, region_start + region_len)`.
///
/// The node array is placed at the start of the region; the pool covers the
/// remainder. Returns the number of usable pool bytes.
///
/// # Safety
///
/// The region must be usable RAM, reachable through the physical-memory
/// window, and not used for anything else afterwards.
pub unsafe fn init_frame_pool(region_start: PhysAddr, region_len: u64) -> u64 {
    let mut aligned_start = region_start.align_up(PAGE_SIZE_4KB).as_u64();
    if aligned_start == 0 {
        // Page 0 is never handed out.
        aligned_start = PAGE_SIZE_4KB;
    }
    let region_end = region_start.as_u64() + region_len;
    assert!(region_end > aligned_start, "frame pool region too small");

    // Carve the node array from the front of the region.
    let avail = region_end - aligned_start;
    let node_count = BuddyAlloc::nodes_required(avail, PAGE_SIZE_4KB);
    let meta_bytes = (node_count * core::mem::size_of::<BuddyNode>()) as u64;
    let pool_start = align_up_u64(aligned_start + meta_bytes, PAGE_SIZE_4KB);
    let pool_size = align_down_u64(region_end - pool_start, PAGE_SIZE_4KB);

    let nodes = crate::hhdm::phys_to_virt(PhysAddr::new(aligned_start)).as_mut_ptr::<BuddyNode>();
    let alloc = BuddyAlloc::new(pool_start, pool_size, PAGE_SIZE_4KB, nodes, node_count)
        .expect("frame pool geometry");

    klog_info!(
        "frame pool: {} KiB at 0x{:x} ({} node slots)",
        pool_size / 1024,
        pool_start,
        node_count
    );

    *FRAME_POOL.lock() = Some(alloc);
    pool_size
}

pub fn frame_pool_ready() -> bool {
    FRAME_POOL.lock().is_some()
}

/// Allocate one 4 KiB frame. Returns `PhysAddr::NULL` when exhausted.
pub fn alloc_page_frame() -> PhysAddr {
    let mut guard = FRAME_POOL.lock();
    match guard.as_mut() {
        Some(pool) => PhysAddr::new(pool.allocate(PAGE_SIZE_4KB)),
        None => PhysAddr::NULL,
    }
}

/// Allocate one zeroed 4 KiB frame.
pub fn alloc_page_frame_zeroed() -> PhysAddr {
    let frame = alloc_page_frame();
    if !frame.is_null() {
        unsafe {
            ptr::write_bytes(
                crate::hhdm::phys_to_virt(frame).as_mut_ptr::<u8>(),
                0,
                PAGE_SIZE_4KB as usize,
            );
        }
    }
    frame
}

/// Allocate `count` physically contiguous frames.
pub fn alloc_page_frames(count: u64) -> PhysAddr {
    if count == 0 {
        return PhysAddr::NULL;
    }
    let mut guard = FRAME_POOL.lock();
    match guard.as_mut() {
        Some(pool) => PhysAddr::new(pool.allocate(count * PAGE_SIZE_4KB)),
        None => PhysAddr::NULL,
    }
}

/// Return one frame to the pool.
pub fn free_page_frame(frame: PhysAddr) {
    let mut guard = FRAME_POOL.lock();
    if let Some(pool) = guard.as_mut() {
        pool.deallocate(frame.as_u64(), PAGE_SIZE_4KB);
    }
}

/// Return `count` contiguous frames.
pub fn free_page_frames(frame: PhysAddr, count: u64) {
    let mut guard = FRAME_POOL.lock();
    if let Some(pool) = guard.as_mut() {
        pool.deallocate(frame.as_u64(), count * PAGE_SIZE_4KB);
    }
}

/// (used, free) byte counts, for diagnostics and the memory map.
pub fn frame_pool_stats() -> (u64, u64) {
    let guard = FRAME_POOL.lock();
    match guard.as_ref() {
        Some(pool) => (pool.bytes_used(), pool.bytes_free()),
        None => (0, 0),
    }
}
