//! Buddy allocator regression tests.
//!
//! Covers: request rounding, used/free accounting, non-overlapping live
//! blocks, implicit sibling coalescing, overbooked non-power-of-two pools,
//! exhaustion behavior, and alignment guarantees.

use keel_lib::testing::TestResult;
use keel_lib::{assert_eq_test, assert_test, define_test_suite, fail, pass};

use crate::buddy::{BuddyAlloc, BuddyNode};

const MIN: u64 = 4096;
const POOL_BASE: u64 = 0x10_0000;
const MAX_NODES: usize = BuddyAlloc::nodes_required(64 * MIN, MIN);

// The buddy never dereferences pool addresses, only its node array, so the
// tests run it over a synthetic address range.
static mut TEST_NODES: [BuddyNode; MAX_NODES] = [BuddyNode::EMPTY; MAX_NODES];

fn make(pool_size: u64) -> BuddyAlloc {
    let nodes = &raw mut TEST_NODES;
    unsafe {
        BuddyAlloc::new(POOL_BASE, pool_size, MIN, nodes as *mut BuddyNode, MAX_NODES)
            .expect("test pool geometry")
    }
}

pub fn test_buddy_rounds_requests_up() -> TestResult {
    let mut pool = make(16 * MIN);
    assert_eq_test!(pool.chunksize(1), MIN, "sub-minimum rounds to min");
    assert_eq_test!(pool.chunksize(MIN + 1), 2 * MIN, "rounds to next power of two");

    let addr = pool.allocate(1);
    assert_test!(addr != 0, "allocation succeeds");
    assert_eq_test!(pool.bytes_used(), MIN, "1-byte request costs one block");
    pool.deallocate(addr, 1);
    assert_eq_test!(pool.bytes_used(), 0, "free returns accounting to zero");
    pass!()
}

pub fn test_buddy_accounting_tracks_live_allocations() -> TestResult {
    let mut pool = make(16 * MIN);
    let a = pool.allocate(MIN);
    let b = pool.allocate(2 * MIN);
    let c = pool.allocate(MIN);
    assert_test!(a != 0 && b != 0 && c != 0, "allocations succeed");
    assert_eq_test!(pool.bytes_used(), 4 * MIN, "used equals sum of rounded sizes");
    assert_eq_test!(pool.bytes_free(), 12 * MIN, "free is the complement");

    pool.deallocate(b, 2 * MIN);
    assert_eq_test!(pool.bytes_used(), 2 * MIN, "used drops by freed size");
    pool.deallocate(a, MIN);
    pool.deallocate(c, MIN);
    assert_eq_test!(pool.bytes_used(), 0, "round trip empties the pool");
    assert_test!(pool.empty(), "pool reports empty");
    pass!()
}

pub fn test_buddy_live_blocks_never_overlap() -> TestResult {
    let mut pool = make(16 * MIN);
    let mut blocks = [(0u64, 0u64); 8];
    let sizes = [MIN, 2 * MIN, MIN, 4 * MIN, MIN, MIN, 2 * MIN, MIN];

    for (slot, &size) in blocks.iter_mut().zip(sizes.iter()) {
        let addr = pool.allocate(size);
        assert_test!(addr != 0, "allocation of {} bytes", size);
        *slot = (addr, size);
    }

    for (i, &(a_addr, a_size)) in blocks.iter().enumerate() {
        for &(b_addr, b_size) in blocks.iter().skip(i + 1) {
            let disjoint = a_addr + a_size <= b_addr || b_addr + b_size <= a_addr;
            assert_test!(disjoint, "blocks 0x{:x} and 0x{:x} overlap", a_addr, b_addr);
        }
    }
    pass!()
}

pub fn test_buddy_coalescing_restores_large_blocks() -> TestResult {
    let mut pool = make(16 * MIN);
    // Fragment the pool into minimum blocks.
    let mut addrs = [0u64; 16];
    for slot in addrs.iter_mut() {
        *slot = pool.allocate(MIN);
        assert_test!(*slot != 0, "fill allocation");
    }
    assert_eq_test!(pool.allocate(MIN), 0, "pool is exhausted");

    // Free everything; the whole arena must be allocatable as one block.
    for &addr in addrs.iter() {
        pool.deallocate(addr, MIN);
    }
    let whole = pool.allocate(16 * MIN);
    assert_test!(whole != 0, "coalesced arena allocatable as one block");
    assert_eq_test!(whole, POOL_BASE, "full-arena block sits at pool start");
    pass!()
}

pub fn test_buddy_overbooked_tail_is_unusable() -> TestResult {
    // 3 pages: the tree covers 4, the 4th is overbooked.
    let mut pool = make(3 * MIN);
    assert_eq_test!(pool.bytes_used(), 0, "overbooked tail not counted as used");
    assert_eq_test!(pool.bytes_free(), 3 * MIN, "free equals the real pool size");

    let a = pool.allocate(MIN);
    let b = pool.allocate(MIN);
    let c = pool.allocate(MIN);
    assert_test!(a != 0 && b != 0 && c != 0, "all real pages allocatable");
    assert_eq_test!(pool.allocate(MIN), 0, "the shadow page never comes out");

    for addr in [a, b, c] {
        assert_test!(
            addr >= POOL_BASE && addr < POOL_BASE + 3 * MIN,
            "block 0x{:x} inside the real pool",
            addr
        );
    }
    pass!()
}

pub fn test_buddy_allocation_failure_returns_null() -> TestResult {
    let mut pool = make(16 * MIN);
    assert_eq_test!(pool.allocate(32 * MIN), 0, "oversized request fails");
    assert_eq_test!(pool.allocate(0), 0, "zero-sized request fails");

    let big = pool.allocate(16 * MIN);
    assert_test!(big != 0, "full-pool allocation succeeds");
    assert_eq_test!(pool.allocate(MIN), 0, "no space left");
    pool.deallocate(big, 16 * MIN);
    pass!()
}

pub fn test_buddy_alignment_follows_block_size() -> TestResult {
    let mut pool = make(64 * MIN);
    let a = pool.allocate_aligned(MIN, 8 * MIN);
    if a == 0 {
        return fail!("aligned allocation failed");
    }
    assert_eq_test!(a % (8 * MIN), 0, "block aligned to requested alignment");
    assert_eq_test!(pool.bytes_used(), 8 * MIN, "alignment inflates the block");
    pool.deallocate(a, 8 * MIN);
    pass!()
}

pub fn test_buddy_prefers_tight_fit() -> TestResult {
    let mut pool = make(16 * MIN);
    // Carve a 2-block hole next to a 1-block allocation; a following
    // 2-block request should land in the tight spot rather than split a
    // pristine large subtree.
    let a = pool.allocate(2 * MIN);
    let b = pool.allocate(2 * MIN);
    pool.deallocate(a, 2 * MIN);
    let c = pool.allocate(2 * MIN);
    assert_eq_test!(c, a, "tightest fitting hole is reused");
    pool.deallocate(b, 2 * MIN);
    pool.deallocate(c, 2 * MIN);
    assert_eq_test!(pool.bytes_used(), 0, "clean teardown");
    pass!()
}

define_test_suite!(
    buddy,
    [
        test_buddy_rounds_requests_up,
        test_buddy_accounting_tracks_live_allocations,
        test_buddy_live_blocks_never_overlap,
        test_buddy_coalescing_restores_large_blocks,
        test_buddy_overbooked_tail_is_unusable,
        test_buddy_allocation_failure_returns_null,
        test_buddy_alignment_follows_block_size,
        test_buddy_prefers_tight_fit,
    ]
);
