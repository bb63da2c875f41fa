//! Monotonic and wall clock.
//!
//! The monotonic clock is a tick counter advanced by the platform timer
//! interrupt (one tick per millisecond once the timer is calibrated). The
//! wall clock is an offset on top of it, set once from the RTC at boot.
//!
//! Before the timer is wired, every accessor returns `0` — early-boot code
//! must tolerate that.

use core::sync::atomic::{AtomicU64, Ordering};

static MONOTONIC_MS: AtomicU64 = AtomicU64::new(0);
static WALL_OFFSET_S: AtomicU64 = AtomicU64::new(0);

/// Advance the monotonic clock. Called from the timer tick handler.
#[inline]
pub fn tick_ms(delta_ms: u64) {
    MONOTONIC_MS.fetch_add(delta_ms, Ordering::Relaxed);
}

/// Milliseconds since boot.
#[inline]
pub fn uptime_ms() -> u64 {
    MONOTONIC_MS.load(Ordering::Relaxed)
}

/// Seconds since boot.
#[inline]
pub fn uptime_s() -> u64 {
    uptime_ms() / 1000
}

/// Set the wall-clock offset (seconds since the epoch at boot instant).
pub fn set_wall_offset(epoch_s: u64) {
    WALL_OFFSET_S.store(epoch_s, Ordering::Relaxed);
}

/// Wall-clock seconds since the epoch. Used for absolute timeouts
/// (conntrack deadlines survive serialization across a live handoff).
#[inline]
pub fn wall_s() -> u64 {
    WALL_OFFSET_S.load(Ordering::Relaxed) + uptime_s()
}

/// Test hook: force the monotonic clock to an absolute value.
pub fn set_uptime_ms_for_test(ms: u64) {
    MONOTONIC_MS.store(ms, Ordering::Relaxed);
}
