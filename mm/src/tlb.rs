//! TLB invalidation.
//!
//! Keel has a single address space, so any CPU may modify the page tables;
//! coherence comes from the shootdown fan-out here. The local flush happens
//! immediately; remote CPUs are rung through the registered IPI hook and
//! perform a full flush in their interrupt handler.

use core::sync::atomic::{AtomicBool, Ordering};

use keel_abi::addr::VirtAddr;
use keel_lib::{cpu, pcr};

static SHOOTDOWN_ENABLED: AtomicBool = AtomicBool::new(false);

/// Enable cross-CPU shootdown once secondary CPUs are online.
pub fn enable_shootdown() {
    SHOOTDOWN_ENABLED.store(true, Ordering::Release);
}

/// Invalidate the mapping for `addr` on every CPU.
pub fn flush_page(addr: VirtAddr) {
    cpu::invlpg(addr);
    shootdown();
}

/// Full TLB flush on every CPU.
pub fn flush_all() {
    cpu::flush_tlb_all();
    shootdown();
}

fn shootdown() {
    if !SHOOTDOWN_ENABLED.load(Ordering::Acquire) {
        return;
    }
    let me = pcr::get_current_cpu();
    for other in 0..pcr::get_cpu_count() {
        if other != me {
            pcr::send_ipi_to_cpu(other);
        }
    }
}

/// Remote side of a shootdown: called from the IPI handler.
pub fn handle_shootdown_ipi() {
    cpu::flush_tlb_all();
}
