//! Kernel heap: the general-purpose side of the buddy allocator.
//!
//! A statically reserved arena served by a `min_size` = 256 B buddy tree.
//! The kernel binary installs [`HeapAllocator`] as `#[global_allocator]`;
//! everything `alloc`-based in the stack (route buckets, conntrack map,
//! VFS arena, fiber stacks) lands here.
//!
//! The allocator initialises itself lazily on first use so that in-kernel
//! tests do not depend on boot ordering.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use keel_lib::IrqMutex;

use crate::buddy::{BuddyAlloc, BuddyNode};

/// Heap arena size. Must be a power of two so the tree has no overbooked
/// tail to subtract from diagnostics.
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

/// Smallest heap chunk.
pub const HEAP_MIN_BLOCK: u64 = 256;

const HEAP_NODE_COUNT: usize = BuddyAlloc::nodes_required(HEAP_SIZE as u64, HEAP_MIN_BLOCK);

/// Aligned heap storage. The arena must be aligned generously so that
/// block-natural alignment (block addr = arena base + multiple of block
/// size) satisfies any `Layout` alignment up to a page.
#[repr(C, align(4096))]
struct AlignedHeap([u8; HEAP_SIZE]);

#[unsafe(link_section = ".bss.heap")]
static mut HEAP_ARENA: AlignedHeap = AlignedHeap([0; HEAP_SIZE]);

static mut HEAP_NODES: [BuddyNode; HEAP_NODE_COUNT] = [BuddyNode::EMPTY; HEAP_NODE_COUNT];

pub struct HeapAllocator {
    inner: IrqMutex<Option<BuddyAlloc>>,
}

impl HeapAllocator {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(None),
        }
    }

    fn with_pool<R>(&self, f: impl FnOnce(&mut BuddyAlloc) -> R) -> R {
        let mut guard = self.inner.lock();
        if guard.is_none() {
            let arena = &raw mut HEAP_ARENA;
            let nodes = &raw mut HEAP_NODES;
            // SAFETY: the statics are used exactly once, behind this lock.
            let pool = unsafe {
                BuddyAlloc::new(
                    arena as u64,
                    HEAP_SIZE as u64,
                    HEAP_MIN_BLOCK,
                    nodes as *mut BuddyNode,
                    HEAP_NODE_COUNT,
                )
            }
            .expect("heap geometry");
            *guard = Some(pool);
        }
        f(guard.as_mut().unwrap())
    }

    /// Bytes currently allocated — the memory map's in-use probe for the
    /// heap range.
    pub fn bytes_in_use(&self) -> u64 {
        self.with_pool(|pool| pool.bytes_used())
    }

    pub fn arena_start(&self) -> u64 {
        (&raw const HEAP_ARENA) as u64
    }

    pub fn arena_size(&self) -> u64 {
        HEAP_SIZE as u64
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for HeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let addr =
            self.with_pool(|pool| pool.allocate_aligned(layout.size() as u64, layout.align() as u64));
        addr as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        self.with_pool(|pool| {
            let size = (layout.size() as u64).max(layout.align() as u64);
            pool.deallocate(ptr as u64, size);
        });
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = self.alloc(layout);
        if !p.is_null() {
            ptr::write_bytes(p, 0, layout.size());
        }
        p
    }
}
