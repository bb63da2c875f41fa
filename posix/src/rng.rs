//! The RNG device behind `/dev/random` and `/dev/urandom`.
//!
//! A xorshift generator seeded from the TSC — entropy quality on par with
//! what a fresh VM can honestly offer; reseed hooks can stir in device
//! randomness later.

use core::sync::atomic::{AtomicU64, Ordering};

use keel_lib::tsc;

static STATE: AtomicU64 = AtomicU64::new(0);

fn next() -> u64 {
    let mut state = STATE.load(Ordering::Relaxed);
    if state == 0 {
        state = tsc::rdtsc() | 1;
    }
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    STATE.store(state, Ordering::Relaxed);
    state
}

/// Stir additional entropy into the pool.
pub fn seed(extra: u64) {
    STATE.fetch_xor(extra | 1, Ordering::Relaxed);
}

/// Fill `buf` with random bytes.
pub fn fill(buf: &mut [u8]) {
    for chunk in buf.chunks_mut(8) {
        let word = next().to_le_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}
