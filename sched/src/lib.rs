#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod context;
pub mod manager;
pub mod sched_tests;
pub mod thread;

pub use manager::{
    add_task, attach, block_until, current_tid, detach, fiber_yield, init_main_thread, spawn,
    with_manager, yield_to,
};
pub use thread::{Thread, ThreadState, Tid, current_thread_tid};
