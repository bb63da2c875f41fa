//! Per-CPU cooperative scheduler.
//!
//! Each CPU owns a [`ThreadManager`]: a thread table, a FIFO of
//! suspended-runnable fibers, a main thread used as the idle fallback, and
//! a `next_thread` slot for directed hand-off. A fiber runs until it
//! yields, blocks or exits — never preempted.
//!
//! Cross-CPU interaction is limited to [`add_task`] (post a closure-free
//! task and ring an IPI) and the detach/attach migration pair, which the
//! caller drives from the involved CPUs themselves: `detach` runs on the
//! source CPU, `attach` on the destination. Within one CPU the cooperative
//! model makes every scheduler operation atomic by construction; the lock
//! is only there for the SMP edges.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use keel_lib::{IrqMutex, MAX_CPUS, klog_debug, pcr};

use crate::context::{SwitchContext, switch_registers};
use crate::thread::{Thread, ThreadState, Tid, current_thread_tid};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedError {
    NotInitialized,
    NotFound,
    /// The main thread cannot be detached.
    IsMain,
    /// The running fiber cannot detach itself.
    IsCurrent,
}

/// A cross-CPU work item. Plain function pointers keep the queue free of
/// allocation on the posting side.
pub type PostedTask = extern "C" fn(usize);

struct Posted {
    task: PostedTask,
    arg: usize,
}

pub struct ThreadManager {
    threads: BTreeMap<Tid, Box<Thread>>,
    /// Suspended-runnable fibers in FIFO order.
    suspended: VecDeque<Tid>,
    main_thread: Tid,
    /// Directed hand-off: the next yield resumes this fiber first.
    next_thread: Option<Tid>,
    current: Tid,
    posted: VecDeque<Posted>,
    /// Exited fibers whose stacks are still live until the next reschedule.
    graveyard: Vec<Box<Thread>>,
    initialized: bool,
}

impl ThreadManager {
    pub const fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            suspended: VecDeque::new(),
            main_thread: -1,
            next_thread: None,
            current: -1,
            posted: VecDeque::new(),
            graveyard: Vec::new(),
            initialized: false,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn runnable_count(&self) -> usize {
        self.suspended.len()
    }

    pub fn current(&self) -> Tid {
        self.current
    }

    pub fn main_tid(&self) -> Tid {
        self.main_thread
    }

    pub fn has_thread(&self, tid: Tid) -> bool {
        self.threads.contains_key(&tid)
    }

    pub fn thread_state(&self, tid: Tid) -> Option<ThreadState> {
        self.threads.get(&tid).map(|t| t.state)
    }

    pub fn thread_is_migrated(&self, tid: Tid) -> Option<bool> {
        self.threads.get(&tid).map(|t| t.migrated)
    }

    fn insert_thread(&mut self, thread: Box<Thread>) {
        self.threads.insert(thread.tid, thread);
    }

    fn erase_suspension(&mut self, tid: Tid) {
        self.suspended.retain(|&t| t != tid);
    }

    /// Pick the next runnable fiber: the hand-off target wins, else FIFO,
    /// else the main thread.
    fn wakeup_next(&mut self) -> Tid {
        if let Some(tid) = self.next_thread.take() {
            self.erase_suspension(tid);
            return tid;
        }
        self.suspended.pop_front().unwrap_or(self.main_thread)
    }

    /// Remove `tid` from this CPU for migration.
    pub fn detach(&mut self, tid: Tid) -> Result<Box<Thread>, SchedError> {
        if !self.initialized {
            return Err(SchedError::NotInitialized);
        }
        if tid == self.main_thread {
            return Err(SchedError::IsMain);
        }
        if tid == self.current {
            return Err(SchedError::IsCurrent);
        }
        let thread = self.threads.remove(&tid).ok_or(SchedError::NotFound)?;
        self.erase_suspension(tid);
        if self.next_thread == Some(tid) {
            self.next_thread = None;
        }
        Ok(thread)
    }

    /// Adopt a fiber detached from another CPU.
    ///
    /// Fibers that have never yielded were frozen at their creation site
    /// rather than inside `fiber_yield`; they are flagged `migrated` so the
    /// next resume takes the first-entry path.
    pub fn attach(&mut self, mut thread: Box<Thread>) {
        thread.parent = self.main_thread;
        if !thread.yielded {
            thread.migrated = true;
        }
        thread.state = ThreadState::Suspended;
        let tid = thread.tid;
        self.insert_thread(thread);
        self.suspended.push_back(tid);
    }

    fn reap_graveyard(&mut self) {
        self.graveyard.clear();
    }
}

static MANAGERS: [IrqMutex<ThreadManager>; MAX_CPUS] =
    [const { IrqMutex::new(ThreadManager::new()) }; MAX_CPUS];

fn this_cpu() -> usize {
    pcr::get_current_cpu()
}

/// Run `f` against a CPU's manager.
pub fn with_manager<R>(cpu: usize, f: impl FnOnce(&mut ThreadManager) -> R) -> R {
    f(&mut MANAGERS[cpu].lock())
}

/// Wrap the executing boot context as this CPU's main (idle-fallback)
/// thread. Must run once per CPU before anything spawns fibers there.
pub fn init_main_thread() {
    let cpu = this_cpu();
    let mut manager = MANAGERS[cpu].lock();
    if manager.initialized {
        return;
    }
    let tid = if cpu == 0 { 0 } else { crate::thread::generate_tid() };
    let main = Thread::main_thread(tid);
    main.anchor_tls();
    manager.main_thread = tid;
    manager.current = tid;
    manager.insert_thread(main);
    manager.initialized = true;
    klog_debug!("sched: cpu {} main thread tid {}", cpu, tid);
}

/// Create a fiber on this CPU running `entry(arg)`. Returns its tid.
pub fn spawn(entry: extern "C" fn(usize), arg: usize) -> Tid {
    let cpu = this_cpu();
    let mut manager = MANAGERS[cpu].lock();
    debug_assert!(manager.initialized, "spawn before init_main_thread");
    let parent = manager.current;
    let thread = Thread::new_fiber(parent, entry, arg);
    let tid = thread.tid;
    manager.insert_thread(thread);
    manager.suspended.push_back(tid);
    tid
}

/// Tid of the running fiber on this CPU.
pub fn current_tid() -> Tid {
    if let Some(tid) = current_thread_tid() {
        return tid;
    }
    MANAGERS[this_cpu()].lock().current
}

/// Voluntarily hand the CPU to the next runnable fiber. Returns when this
/// fiber is resumed — immediately, if there is nothing else to run.
pub fn fiber_yield() {
    let cpu = this_cpu();

    let (prev_ctx, next_ctx): (*mut SwitchContext, *const SwitchContext) = {
        let mut manager = MANAGERS[cpu].lock();
        if !manager.initialized {
            return;
        }
        manager.reap_graveyard();
        drain_posted(&mut manager);

        if manager.suspended.is_empty() && manager.next_thread.is_none() {
            return;
        }

        let cur = manager.current;
        {
            let thread = manager.threads.get_mut(&cur).expect("current in table");
            thread.state = ThreadState::Suspended;
            thread.yielded = true;
        }
        manager.suspended.push_back(cur);

        let next_tid = manager.wakeup_next();
        if next_tid == cur {
            let thread = manager.threads.get_mut(&cur).unwrap();
            thread.state = ThreadState::Running;
            manager.erase_suspension(cur);
            return;
        }

        manager.current = next_tid;
        let next = manager.threads.get_mut(&next_tid).expect("next in table");
        next.state = ThreadState::Running;
        next.migrated = false;
        next.anchor_tls();
        let next_ptr = &next.ctx as *const SwitchContext;
        let prev_ptr = &mut manager.threads.get_mut(&cur).unwrap().ctx as *mut SwitchContext;
        (prev_ptr, next_ptr)
    };

    // The guard is dropped; the box contents are stable in the heap, and
    // only this CPU schedules its own fibers.
    switch_registers(prev_ctx, next_ctx);
}

/// Yield directly to `tid` (hand-off priority slot).
pub fn yield_to(tid: Tid) {
    {
        let mut manager = MANAGERS[this_cpu()].lock();
        if manager.has_thread(tid) {
            manager.next_thread = Some(tid);
        }
    }
    fiber_yield();
}

/// Cooperatively spin until `cond` holds. The suspension points of every
/// blocking socket/FD call bottom out here.
pub fn block_until(mut cond: impl FnMut() -> bool) {
    while !cond() {
        fiber_yield();
        core::hint::spin_loop();
    }
}

/// Terminate the running fiber. Selects a successor (preferring the parent
/// when it is runnable on this CPU) and never returns.
pub(crate) extern "C" fn fiber_exit_impl() {
    let cpu = this_cpu();

    let next_ctx: *const SwitchContext = {
        let mut manager = MANAGERS[cpu].lock();
        let cur = manager.current;
        let mut me = manager.threads.remove(&cur).expect("exiting fiber in table");
        me.state = ThreadState::Done;
        let parent = me.parent;
        // The stack stays live until the switch completes; the next
        // reschedule reaps it.
        manager.graveyard.push(me);

        let next_tid = if parent != cur
            && manager.has_thread(parent)
            && manager.suspended.contains(&parent)
        {
            manager.erase_suspension(parent);
            parent
        } else {
            manager.wakeup_next()
        };

        manager.current = next_tid;
        let next = manager.threads.get_mut(&next_tid).expect("successor in table");
        next.state = ThreadState::Running;
        next.migrated = false;
        next.anchor_tls();
        &next.ctx as *const SwitchContext
    };

    switch_registers(core::ptr::null_mut(), next_ctx);
    unreachable!("exited fiber resumed");
}

/// Detach `tid` from this CPU (first half of a migration).
pub fn detach(tid: Tid) -> Result<Box<Thread>, SchedError> {
    MANAGERS[this_cpu()].lock().detach(tid)
}

/// Attach a detached fiber to this CPU (second half of a migration).
pub fn attach(thread: Box<Thread>) {
    MANAGERS[this_cpu()].lock().attach(thread);
}

/// Post `task(arg)` to run on `cpu` and ring it. The task is wrapped in a
/// fresh fiber when the target next reschedules.
pub fn add_task(task: PostedTask, arg: usize, cpu: usize) {
    MANAGERS[cpu].lock().posted.push_back(Posted { task, arg });
    pcr::send_ipi_to_cpu(cpu);
}

fn drain_posted(manager: &mut ThreadManager) {
    while let Some(posted) = manager.posted.pop_front() {
        let parent = manager.current;
        let thread = Thread::new_fiber(parent, posted.task, posted.arg);
        let tid = thread.tid;
        manager.insert_thread(thread);
        manager.suspended.push_back(tid);
    }
}

/// Drain posted work and run pending fibers once. Called from the idle
/// loop so a CPU that is otherwise asleep still serves `add_task`.
pub fn idle_poll() {
    fiber_yield();
}
