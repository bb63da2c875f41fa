//! The process-global descriptor table.
//!
//! Integers from 3 upward, assigned monotonically; 0/1/2 are reserved for
//! debug output and never stored in the map.

extern crate alloc;

use alloc::collections::BTreeMap;

use keel_lib::IrqMutex;

use super::errno::EBADF;
use super::fd::FdEntry;

pub const FD_STDIN: i32 = 0;
pub const FD_STDOUT: i32 = 1;
pub const FD_STDERR: i32 = 2;

const FIRST_FD: i32 = 3;

struct FdMap {
    map: BTreeMap<i32, FdEntry>,
    counter: i32,
}

static FD_MAP: IrqMutex<FdMap> = IrqMutex::new(FdMap {
    map: BTreeMap::new(),
    counter: FIRST_FD,
});

/// Insert an entry, returning its new descriptor.
pub fn open_fd(entry: FdEntry) -> i32 {
    let mut table = FD_MAP.lock();
    let fd = table.counter;
    table.counter += 1;
    table.map.insert(fd, entry);
    fd
}

/// Remove a descriptor, returning its entry for teardown.
pub fn close_fd(fd: i32) -> Option<FdEntry> {
    FD_MAP.lock().map.remove(&fd)
}

/// Run `f` against the entry for `fd`; `-EBADF` when it does not exist.
pub fn with_fd<R>(fd: i32, f: impl FnOnce(&mut FdEntry) -> R) -> Result<R, i32> {
    let mut table = FD_MAP.lock();
    match table.map.get_mut(&fd) {
        Some(entry) => Ok(f(entry)),
        None => Err(-EBADF),
    }
}

pub fn fd_exists(fd: i32) -> bool {
    FD_MAP.lock().map.contains_key(&fd)
}

pub fn open_count() -> usize {
    FD_MAP.lock().map.len()
}

/// Drop every descriptor (test teardown).
pub fn reset_for_tests() {
    let mut table = FD_MAP.lock();
    table.map.clear();
    table.counter = FIRST_FD;
}
