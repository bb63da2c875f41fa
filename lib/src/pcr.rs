//! Per-CPU registry.
//!
//! The scheduler owns a `ThreadManager` per CPU; cross-CPU work posting
//! needs to know which CPU is running and how to ring a target CPU. Both
//! are registered here as function hooks during boot so this crate stays
//! free of APIC knowledge.

use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

pub const MAX_CPUS: usize = 64;

pub type CurrentCpuFn = fn() -> usize;
pub type SendIpiToCpuFn = fn(cpu: usize);

static CURRENT_CPU_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static SEND_IPI_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static ONLINE_COUNT: AtomicU32 = AtomicU32::new(1);
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Register the "which CPU am I" resolver (typically an APIC-ID lookup).
pub fn register_current_cpu_fn(f: CurrentCpuFn) {
    CURRENT_CPU_FN.store(f as *mut (), Ordering::Release);
}

/// Register the hook used to interrupt a remote CPU after posting work.
pub fn register_send_ipi_to_cpu_fn(f: SendIpiToCpuFn) {
    SEND_IPI_FN.store(f as *mut (), Ordering::Release);
}

/// Index of the executing CPU. Before SMP bring-up this is always 0.
#[inline]
pub fn get_current_cpu() -> usize {
    let ptr = CURRENT_CPU_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return 0;
    }
    // SAFETY: only valid CurrentCpuFn pointers are stored.
    let f: CurrentCpuFn = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Ring a remote CPU. No-op until a hook is registered.
#[inline]
pub fn send_ipi_to_cpu(cpu: usize) {
    let ptr = SEND_IPI_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: only valid SendIpiToCpuFn pointers are stored.
    let f: SendIpiToCpuFn = unsafe { core::mem::transmute(ptr) };
    f(cpu);
}

pub fn mark_cpu_online(cpu: usize) {
    ONLINE_COUNT.fetch_add(1, Ordering::Relaxed);
    let count = CPU_COUNT.load(Ordering::Relaxed);
    if cpu + 1 > count {
        CPU_COUNT.store(cpu + 1, Ordering::Relaxed);
    }
}

#[inline]
pub fn get_cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Relaxed)
}
