//! Fiber descriptors and thread-local storage.
//!
//! Each fiber owns a stack and a small TLS block anchored in `IA32_FS_BASE`.
//! The TLS block starts with a self-pointer (the classic x86_64 TLS ABI
//! shape) followed by a pointer back to the [`Thread`] descriptor, so
//! [`current_thread_tid`] answers without consulting the scheduler.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};

use keel_abi::addr::VirtAddr;
use keel_lib::cpu;

use crate::context::SwitchContext;

pub type Tid = i32;

/// Default fiber stack size.
pub const FIBER_STACK_SIZE: usize = 64 * 1024;

/// Globally unique, monotone thread id generator. Tid 0 is the boot CPU's
/// main thread.
static THREAD_COUNTER: AtomicI32 = AtomicI32::new(1);

pub fn generate_tid() -> Tid {
    THREAD_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    New,
    Running,
    Suspended,
    Done,
}

/// Thread-local block. `self_ptr` must stay at offset 0.
#[repr(C)]
pub struct TlsBlock {
    pub self_ptr: *mut TlsBlock,
    pub thread_tid: Tid,
}

pub struct Thread {
    pub tid: Tid,
    /// Lookup relation only — a parent never owns its children.
    pub parent: Tid,
    pub state: ThreadState,
    /// Last suspension was a voluntary yield (as opposed to never-ran).
    pub yielded: bool,
    /// Set by `attach` when the fiber crossed CPUs before its first run;
    /// the next resume takes the first-entry path rather than the
    /// yield-restore path.
    pub migrated: bool,
    /// CLONE_CHILD_CLEARTID-style address zeroed on exit.
    pub clear_tid: Option<*mut i32>,
    pub ctx: SwitchContext,
    tls: Box<TlsBlock>,
    /// Owned stack. `None` for main threads, which run on the boot stack.
    stack: Option<Vec<u8>>,
}

// SAFETY: threads migrate between CPUs only through detach/attach, which
// transfer exclusive ownership.
unsafe impl Send for Thread {}

impl Thread {
    /// Create a fiber that will enter `entry(arg)` on its own stack.
    pub fn new_fiber(parent: Tid, entry: extern "C" fn(usize), arg: usize) -> Box<Thread> {
        let tid = generate_tid();
        let stack = vec![0u8; FIBER_STACK_SIZE];
        let stack_top = stack.as_ptr() as u64 + FIBER_STACK_SIZE as u64;

        let mut tls = Box::new(TlsBlock {
            self_ptr: core::ptr::null_mut(),
            thread_tid: tid,
        });
        tls.self_ptr = &mut *tls as *mut TlsBlock;

        // SAFETY: the stack was just allocated and is owned by this thread.
        let ctx = unsafe { SwitchContext::new_for_fiber(entry, arg, stack_top) };

        Box::new(Thread {
            tid,
            parent,
            state: ThreadState::New,
            yielded: false,
            migrated: false,
            clear_tid: None,
            ctx,
            tls,
            stack: Some(stack),
        })
    }

    /// Wrap the currently executing boot context as a main thread.
    pub fn main_thread(tid: Tid) -> Box<Thread> {
        let mut tls = Box::new(TlsBlock {
            self_ptr: core::ptr::null_mut(),
            thread_tid: tid,
        });
        tls.self_ptr = &mut *tls as *mut TlsBlock;

        Box::new(Thread {
            tid,
            parent: tid,
            state: ThreadState::Running,
            yielded: false,
            migrated: false,
            clear_tid: None,
            ctx: SwitchContext::zeroed(),
            tls,
            stack: None,
        })
    }

    /// Store this thread's TLS block in FS. Runs on every context switch so
    /// that [`current_thread_tid`] is always right.
    pub fn anchor_tls(&self) {
        cpu::set_fs_base(VirtAddr::new(&*self.tls as *const TlsBlock as u64));
    }

    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(addr) = self.clear_tid {
            // SAFETY: the creator registered a live i32 to clear on exit.
            unsafe { *addr = 0 };
        }
    }
}

/// Tid of the running fiber, read from TLS without touching the scheduler.
/// Returns `None` before TLS is anchored (early boot).
pub fn current_thread_tid() -> Option<Tid> {
    let base = cpu::fs_base();
    if base.is_null() {
        return None;
    }
    let block = base.as_ptr::<TlsBlock>();
    // SAFETY: FS base is only ever set to a live TlsBlock by anchor_tls.
    unsafe {
        if (*block).self_ptr as u64 != base.as_u64() {
            return None;
        }
        Some((*block).thread_tid)
    }
}
