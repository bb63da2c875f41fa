#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

//! POSIX emulation: a file-descriptor table in front of the TCP/UDP socket
//! layers, the VFS, and the RNG device. The application is linked into
//! ring 0, so a "syscall" here is a plain function call that speaks the
//! familiar types: integer descriptors and negative errno returns.

extern crate alloc;

pub mod errno;
pub mod fd;
pub mod fd_map;
pub mod posix_tests;
pub mod rng;
pub mod sockcalls;
pub mod unistd;

pub use errno::*;
pub use fd_map::{FD_STDERR, FD_STDIN, FD_STDOUT};
