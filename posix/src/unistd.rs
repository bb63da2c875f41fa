//! `open`/`read`/`write`/`lseek`/`close` over the descriptor table.
//!
//! Returns follow libc conventions: byte counts or `-errno`. FDs 0/1/2 are
//! the debug console; writes to them land in the kernel log, reads return
//! end-of-file.

extern crate alloc;

use keel_lib::klog_info;
use keel_net::{tcp, tcp_socket, udp};

use super::errno::*;
use super::fd::{FdEntry, FdKind};
use super::fd_map::{self, FD_STDERR, FD_STDIN, FD_STDOUT};
use super::rng;

pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

/// Open a path. `/dev/random` and `/dev/urandom` pipe to the RNG; all
/// other paths resolve through the VFS.
pub fn open(path: &str) -> i32 {
    let iface = keel_net::inet::default_iface().unwrap_or(keel_net::types::DevIndex(0));

    if path == "/dev/random" || path == "/dev/urandom" {
        return fd_map::open_fd(FdEntry::new(FdKind::Random, iface));
    }

    match keel_fs::stat_path(path) {
        Ok(dirent) => fd_map::open_fd(FdEntry::new(FdKind::File { dirent, offset: 0 }, iface)),
        Err(e) => fs_errno(e),
    }
}

pub fn read(fd: i32, buf: &mut [u8]) -> isize {
    if fd == FD_STDIN {
        return 0;
    }
    if fd == FD_STDOUT || fd == FD_STDERR {
        return -EBADF as isize;
    }

    // Stage one under the table lock: classify and snapshot.
    enum Plan {
        File(keel_fs::Dirent, u64),
        Random,
        Tcp(tcp::ConnId, bool),
        Udp(udp::UdpId, bool),
    }

    let plan = match fd_map::with_fd(fd, |entry| match &entry.kind {
        FdKind::File { dirent, offset } => Ok(Plan::File(dirent.clone(), *offset)),
        FdKind::Random => Ok(Plan::Random),
        FdKind::TcpConn { conn } => Ok(Plan::Tcp(*conn, entry.nonblocking)),
        FdKind::Udp { socket } => Ok(Plan::Udp(*socket, entry.nonblocking)),
        FdKind::TcpListener { .. } | FdKind::TcpUnbound => Err(-ENOTCONN as isize),
    }) {
        Ok(Ok(plan)) => plan,
        Ok(Err(e)) => return e,
        Err(e) => return e as isize,
    };

    match plan {
        Plan::File(dirent, offset) => {
            if dirent.is_dir() {
                return -EISDIR as isize;
            }
            match dirent.read(offset, buf.len() as u64) {
                Ok(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    let _ = fd_map::with_fd(fd, |entry| {
                        if let FdKind::File { offset, .. } = &mut entry.kind {
                            *offset += n as u64;
                        }
                    });
                    n as isize
                }
                Err(e) => fs_errno(e) as isize,
            }
        }
        Plan::Random => {
            rng::fill(buf);
            buf.len() as isize
        }
        Plan::Tcp(conn, nonblocking) => {
            let result = if nonblocking {
                tcp::recv(conn, buf)
            } else {
                tcp_socket::recv(conn, buf)
            };
            match result {
                Ok(n) => n as isize,
                Err(e) => net_errno(e) as isize,
            }
        }
        Plan::Udp(socket, nonblocking) => loop {
            match udp::recvfrom(socket, buf) {
                Ok((n, _from)) => return n as isize,
                Err(keel_net::types::NetError::WouldBlock) if !nonblocking => {
                    keel_sched::fiber_yield();
                    core::hint::spin_loop();
                }
                Err(e) => return net_errno(e) as isize,
            }
        },
    }
}

pub fn write(fd: i32, buf: &[u8]) -> isize {
    if fd == FD_STDOUT || fd == FD_STDERR {
        if let Ok(text) = core::str::from_utf8(buf) {
            klog_info!("{}", text.trim_end_matches('\n'));
        }
        return buf.len() as isize;
    }
    if fd == FD_STDIN {
        return -EBADF as isize;
    }

    enum Plan {
        Tcp(tcp::ConnId),
        Udp(udp::UdpId),
        Seed,
        ReadOnly,
    }

    let plan = match fd_map::with_fd(fd, |entry| match &entry.kind {
        FdKind::TcpConn { conn } => Plan::Tcp(*conn),
        FdKind::Udp { socket } => Plan::Udp(*socket),
        FdKind::Random => Plan::Seed,
        FdKind::File { .. } => Plan::ReadOnly,
        FdKind::TcpListener { .. } | FdKind::TcpUnbound => Plan::ReadOnly,
    }) {
        Ok(plan) => plan,
        Err(e) => return e as isize,
    };

    match plan {
        Plan::Tcp(conn) => match tcp::send(conn, buf) {
            Ok(n) => n as isize,
            Err(e) => net_errno(e) as isize,
        },
        Plan::Udp(socket) => match udp::send(socket, buf) {
            Ok(n) => n as isize,
            Err(e) => net_errno(e) as isize,
        },
        Plan::Seed => {
            let mut word = [0u8; 8];
            let n = buf.len().min(8);
            word[..n].copy_from_slice(&buf[..n]);
            rng::seed(u64::from_le_bytes(word));
            buf.len() as isize
        }
        // The mounted filesystems are read-only media.
        Plan::ReadOnly => -EBADF as isize,
    }
}

pub fn lseek(fd: i32, offset: i64, whence: i32) -> i64 {
    let result = fd_map::with_fd(fd, |entry| match &mut entry.kind {
        FdKind::File {
            dirent,
            offset: cursor,
        } => {
            let base = match whence {
                SEEK_SET => 0i64,
                SEEK_CUR => *cursor as i64,
                SEEK_END => dirent.size as i64,
                _ => return -EINVAL as i64,
            };
            let target = base + offset;
            if target < 0 {
                return -EINVAL as i64;
            }
            *cursor = target as u64;
            target
        }
        _ => -ESPIPE as i64,
    });
    match result {
        Ok(pos) => pos,
        Err(e) => e as i64,
    }
}

pub fn close(fd: i32) -> i32 {
    let Some(entry) = fd_map::close_fd(fd) else {
        return -EBADF;
    };
    match entry.kind {
        FdKind::TcpConn { conn } => {
            let _ = tcp_socket::close(conn);
        }
        FdKind::TcpListener { port } => {
            tcp_socket::close_listener(port);
        }
        FdKind::Udp { socket } => {
            udp::close(socket);
        }
        FdKind::File { .. } | FdKind::Random | FdKind::TcpUnbound => {}
    }
    0
}
