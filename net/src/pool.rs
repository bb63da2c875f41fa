//! Fixed packet-buffer store with lock-free allocation.
//!
//! Every packet in the stack lives in one of these slots; the NIC fills
//! them on RX, the protocols claim them on TX, and dropping the owning
//! [`PacketBuf`](super::packetbuf::PacketBuf) releases the slot. O(1)
//! alloc/release from any context (including interrupts) via a Treiber
//! stack with ABA-safe tagged pointers.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};

use keel_lib::InitFlag;

/// Size of each buffer slot: a maximum Ethernet frame (1518) plus headroom.
pub const BUF_SIZE: usize = 2048;

/// Number of pre-allocated slots.
pub const POOL_SIZE: usize = 256;

/// End-of-freelist / pool-exhausted sentinel.
const FREELIST_EMPTY: u16 = u16::MAX;

// =============================================================================
// Static backing storage
// =============================================================================

/// Raw slot storage, 64-byte aligned, living in BSS.
///
/// Interior mutability is sound because the pool's allocation discipline
/// guarantees each slot is owned by at most one `PacketBuf` at a time.
#[repr(C, align(64))]
struct PoolStorage {
    slots: UnsafeCell<[[u8; BUF_SIZE]; POOL_SIZE]>,
}

// SAFETY: slot access is serialized by the pool ownership model (move-only
// PacketBuf, no Clone).
unsafe impl Sync for PoolStorage {}

static POOL_STORAGE: PoolStorage = PoolStorage {
    slots: UnsafeCell::new([[0u8; BUF_SIZE]; POOL_SIZE]),
};

// =============================================================================
// Pool
// =============================================================================

/// Lock-free packet buffer pool.
///
/// The head is a packed `u32`: bits `[15:0]` = slot index (or
/// [`FREELIST_EMPTY`]), bits `[31:16]` = version counter for ABA
/// prevention.
pub struct PacketPool {
    head: AtomicU32,
    /// Per-slot next-free pointer, forming the intrusive freelist.
    next: [AtomicU16; POOL_SIZE],
    /// Free slot count (diagnostic).
    count: AtomicUsize,
    initialized: InitFlag,
}

// SAFETY: all fields are atomics.
unsafe impl Send for PacketPool {}
unsafe impl Sync for PacketPool {}

/// The global packet pool. [`PacketPool::init`] must run before any
/// networking; later calls are no-ops.
pub static PACKET_POOL: PacketPool = PacketPool {
    head: AtomicU32::new(FREELIST_EMPTY as u32),
    next: [const { AtomicU16::new(0) }; POOL_SIZE],
    count: AtomicUsize::new(0),
    initialized: InitFlag::new(),
};

impl PacketPool {
    /// Build the freelist `0 → 1 → … → POOL_SIZE-1 → ∅`.
    pub fn init(&self) {
        if self.initialized.test_and_set() {
            return;
        }

        for i in 0..POOL_SIZE {
            let next = if i + 1 < POOL_SIZE {
                (i + 1) as u16
            } else {
                FREELIST_EMPTY
            };
            self.next[i].store(next, Ordering::Relaxed);
        }

        // Release makes the next[] chain visible to whoever observes head.
        self.head.store(0, Ordering::Release);
        self.count.store(POOL_SIZE, Ordering::Release);
    }

    /// Allocate a slot. `None` when the pool is exhausted.
    pub fn alloc(&self) -> Option<u16> {
        loop {
            let old = self.head.load(Ordering::Acquire);
            let idx = (old & 0xFFFF) as u16;
            if idx == FREELIST_EMPTY {
                return None;
            }
            let ver = old >> 16;
            let next_idx = self.next[idx as usize].load(Ordering::Relaxed);
            let new = (ver.wrapping_add(1) << 16) | (next_idx as u32);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.count.fetch_sub(1, Ordering::Relaxed);
                return Some(idx);
            }
            core::hint::spin_loop();
        }
    }

    /// Return a slot to the pool. The caller must not touch the slot's data
    /// afterwards.
    pub fn release(&self, slot: u16) {
        debug_assert!((slot as usize) < POOL_SIZE, "release: bad slot {}", slot);
        loop {
            let old = self.head.load(Ordering::Acquire);
            let old_idx = (old & 0xFFFF) as u16;
            let ver = old >> 16;
            self.next[slot as usize].store(old_idx, Ordering::Relaxed);
            let new = (ver.wrapping_add(1) << 16) | (slot as u32);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.count.fetch_add(1, Ordering::Relaxed);
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Free slots remaining (racy snapshot, diagnostics only).
    #[inline]
    pub fn available(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.is_set()
    }

    /// Raw pointer to the first byte of `slot`, valid for [`BUF_SIZE`]
    /// bytes. The caller must own the slot.
    #[inline]
    pub(crate) fn slot_data(&self, slot: u16) -> *mut u8 {
        debug_assert!((slot as usize) < POOL_SIZE);
        // SAFETY: in-bounds because slot < POOL_SIZE.
        unsafe { (POOL_STORAGE.slots.get() as *mut u8).add(slot as usize * BUF_SIZE) }
    }
}
