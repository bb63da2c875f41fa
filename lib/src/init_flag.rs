//! One-shot initialization flags.

use core::sync::atomic::{AtomicBool, Ordering};

/// A latch that transitions from unset to set exactly once.
pub struct InitFlag(AtomicBool);

impl InitFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[inline]
    pub fn mark_set(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Set the flag, returning whether it was already set.
    #[inline]
    pub fn test_and_set(&self) -> bool {
        self.0.swap(true, Ordering::AcqRel)
    }
}

impl Default for InitFlag {
    fn default() -> Self {
        Self::new()
    }
}
