//! errno mirrors. Calls return `-errno` directly, libc style.

pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const EBADF: i32 = 9;
pub const EAGAIN: i32 = 11;
pub const EACCES: i32 = 13;
pub const EEXIST: i32 = 17;
pub const ENOTDIR: i32 = 20;
pub const EISDIR: i32 = 21;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;
pub const ESPIPE: i32 = 29;
pub const EPIPE: i32 = 32;
pub const ENOTEMPTY: i32 = 39;
pub const ENOTSOCK: i32 = 88;
pub const EOPNOTSUPP: i32 = 95;
pub const EADDRINUSE: i32 = 98;
pub const ENETUNREACH: i32 = 101;
pub const ECONNRESET: i32 = 104;
pub const ENOBUFS: i32 = 105;
pub const EISCONN: i32 = 106;
pub const ENOTCONN: i32 = 107;
pub const ETIMEDOUT: i32 = 110;
pub const ECONNREFUSED: i32 = 111;
pub const EHOSTUNREACH: i32 = 113;
pub const EINPROGRESS: i32 = 115;

use keel_fs::FsError;
use keel_net::types::NetError;

/// Map a filesystem error onto `-errno`.
pub fn fs_errno(err: FsError) -> i32 {
    -match err {
        FsError::NotFound => ENOENT,
        FsError::NotDir => ENOTDIR,
        FsError::NotFile => EISDIR,
        FsError::IoError => EBADF,
        FsError::InvalidPath => EINVAL,
        FsError::NoSpace => ENOSPC,
        FsError::NotEmpty => ENOTEMPTY,
        FsError::AlreadyExists => EEXIST,
        FsError::Unsupported => EOPNOTSUPP,
    }
}

/// Map a network error onto `-errno` (delegates to the stack's table).
pub fn net_errno(err: NetError) -> i32 {
    err.to_errno()
}
