//! Emulated socket calls.
//!
//! `socket`/`bind`/`listen`/`accept`/`connect`/`send*`/`recv*`/
//! `setsockopt`/`shutdown` dispatching on the descriptor kind. Blocking
//! accept and connect suspend the calling fiber; `O_NONBLOCK` turns them
//! into `-EAGAIN` / `-EINPROGRESS` returns.

extern crate alloc;

use keel_abi::net::{AF_INET, O_NONBLOCK, SO_BROADCAST, SO_RCVBUF, SOCK_DGRAM, SOCK_STREAM, SockAddrIn};
use keel_net::types::{DevIndex, NetError, Port, Socket};
use keel_net::{tcp, tcp_socket, udp};

use super::errno::*;
use super::fd::{FdEntry, FdKind};
use super::fd_map;

fn default_iface() -> DevIndex {
    keel_net::inet::default_iface().unwrap_or(DevIndex(0))
}

/// Create a socket descriptor. UDP sockets bind an ephemeral port
/// immediately; an explicit `bind` replaces it.
pub fn socket(domain: u16, sock_type: i32, _protocol: i32) -> i32 {
    if domain != AF_INET {
        return -EINVAL;
    }
    let iface = default_iface();
    match sock_type {
        SOCK_STREAM => fd_map::open_fd(FdEntry::new(FdKind::TcpUnbound, iface)),
        SOCK_DGRAM => match udp::bind(iface, Port(0)) {
            Ok(socket) => fd_map::open_fd(FdEntry::new(FdKind::Udp { socket }, iface)),
            Err(e) => net_errno(e),
        },
        _ => -EINVAL,
    }
}

/// Toggle `O_NONBLOCK` (the `fcntl(F_SETFL)` subset keel supports).
pub fn set_nonblocking(fd: i32, flags: i32) -> i32 {
    match fd_map::with_fd(fd, |entry| entry.nonblocking = flags & O_NONBLOCK != 0) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

pub fn bind(fd: i32, addr: &SockAddrIn) -> i32 {
    let local = match Socket::from_user(addr) {
        Ok(local) => local,
        Err(e) => return net_errno(e),
    };

    enum Plan {
        Tcp,
        Udp(udp::UdpId, DevIndex),
        Wrong,
    }

    let plan = match fd_map::with_fd(fd, |entry| match &entry.kind {
        FdKind::TcpUnbound => Plan::Tcp,
        FdKind::Udp { socket } => Plan::Udp(*socket, entry.iface),
        _ => Plan::Wrong,
    }) {
        Ok(plan) => plan,
        Err(e) => return e,
    };

    match plan {
        Plan::Tcp => {
            // TCP defers the real bind to listen/connect; the port is
            // reserved here only against other FD-level binds.
            let _ = fd_map::with_fd(fd, |entry| entry.bound = Some(local));
            0
        }
        Plan::Udp(old, iface) => {
            // Rebind: the ephemeral socket from `socket()` is replaced.
            let broadcast = fd_map::with_fd(fd, |e| e.broadcast).unwrap_or(false);
            udp::close(old);
            match udp::bind(iface, local.port) {
                Ok(socket) => {
                    if broadcast {
                        let _ = udp::set_broadcast(socket, true);
                    }
                    let _ = fd_map::with_fd(fd, |entry| {
                        entry.kind = FdKind::Udp { socket };
                        entry.bound = Some(local);
                    });
                    0
                }
                Err(e) => net_errno(e),
            }
        }
        Plan::Wrong => -EINVAL,
    }
}

pub fn listen(fd: i32, backlog: i32) -> i32 {
    let (iface, bound) = match fd_map::with_fd(fd, |entry| {
        if matches!(entry.kind, FdKind::TcpUnbound) {
            Ok((entry.iface, entry.bound))
        } else {
            Err(-EINVAL)
        }
    }) {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return e,
        Err(e) => return e,
    };

    let Some(local) = bound else {
        return -EINVAL;
    };

    match tcp_socket::listen(iface, local, backlog.max(0) as usize) {
        Ok(_) => {
            let _ = fd_map::with_fd(fd, |entry| {
                entry.kind = FdKind::TcpListener { port: local.port };
            });
            0
        }
        Err(e) => net_errno(e),
    }
}

/// Accept a pending connection, blocking (cooperatively) unless the
/// listener is non-blocking. Returns the new descriptor.
pub fn accept(fd: i32, addr_out: Option<&mut SockAddrIn>) -> i32 {
    let (port, iface, nonblocking) = match fd_map::with_fd(fd, |entry| match entry.kind {
        FdKind::TcpListener { port } => Ok((port, entry.iface, entry.nonblocking)),
        _ => Err(-EINVAL),
    }) {
        Ok(Ok(tuple)) => tuple,
        Ok(Err(e)) => return e,
        Err(e) => return e,
    };

    let conn = if nonblocking {
        match tcp_socket::try_accept(port) {
            Some(conn) => conn,
            None => return -EAGAIN,
        }
    } else {
        match tcp_socket::accept(port) {
            Ok(conn) => conn,
            Err(e) => return net_errno(e),
        }
    };

    if let Some(out) = addr_out {
        if let Some(tuple) = tcp::tuple_of(conn) {
            *out = tuple.remote.to_user();
        }
    }

    fd_map::open_fd(FdEntry::new(FdKind::TcpConn { conn }, iface))
}

pub fn connect(fd: i32, addr: &SockAddrIn) -> i32 {
    let remote = match Socket::from_user(addr) {
        Ok(remote) => remote,
        Err(e) => return net_errno(e),
    };

    enum Plan {
        Tcp(DevIndex, bool),
        Udp(udp::UdpId),
        Already,
        Wrong,
    }

    let plan = match fd_map::with_fd(fd, |entry| match &entry.kind {
        FdKind::TcpUnbound => Plan::Tcp(entry.iface, entry.nonblocking),
        FdKind::Udp { socket } => Plan::Udp(*socket),
        FdKind::TcpConn { .. } => Plan::Already,
        _ => Plan::Wrong,
    }) {
        Ok(plan) => plan,
        Err(e) => return e,
    };

    match plan {
        Plan::Tcp(iface, nonblocking) => {
            if nonblocking {
                match tcp_socket::connect_nonblocking(iface, remote) {
                    Ok(conn) => {
                        let _ = fd_map::with_fd(fd, |entry| {
                            entry.kind = FdKind::TcpConn { conn };
                        });
                        -EINPROGRESS
                    }
                    Err(e) => net_errno(e),
                }
            } else {
                match tcp_socket::connect(iface, remote) {
                    Ok(conn) => {
                        let _ = fd_map::with_fd(fd, |entry| {
                            entry.kind = FdKind::TcpConn { conn };
                        });
                        0
                    }
                    Err(e) => net_errno(e),
                }
            }
        }
        Plan::Udp(socket) => match udp::connect(socket, remote) {
            Ok(()) => 0,
            Err(e) => net_errno(e),
        },
        Plan::Already => -EISCONN,
        Plan::Wrong => -EINVAL,
    }
}

pub fn send(fd: i32, buf: &[u8], _flags: i32) -> isize {
    super::unistd::write(fd, buf)
}

pub fn recv(fd: i32, buf: &mut [u8], _flags: i32) -> isize {
    super::unistd::read(fd, buf)
}

pub fn sendto(fd: i32, buf: &[u8], _flags: i32, addr: &SockAddrIn) -> isize {
    let dest = match Socket::from_user(addr) {
        Ok(dest) => dest,
        Err(e) => return net_errno(e) as isize,
    };
    let socket = match fd_map::with_fd(fd, |entry| match entry.kind {
        FdKind::Udp { socket } => Ok(socket),
        _ => Err(-EOPNOTSUPP),
    }) {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => return e as isize,
        Err(e) => return e as isize,
    };
    match udp::sendto(socket, dest, buf) {
        Ok(n) => n as isize,
        Err(e) => net_errno(e) as isize,
    }
}

pub fn recvfrom(fd: i32, buf: &mut [u8], _flags: i32, addr_out: Option<&mut SockAddrIn>) -> isize {
    let (socket, nonblocking) = match fd_map::with_fd(fd, |entry| match entry.kind {
        FdKind::Udp { socket } => Ok((socket, entry.nonblocking)),
        _ => Err(-EOPNOTSUPP),
    }) {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return e as isize,
        Err(e) => return e as isize,
    };

    let mut addr_out = addr_out;
    loop {
        match udp::recvfrom(socket, buf) {
            Ok((n, from)) => {
                if let Some(out) = addr_out.as_mut() {
                    **out = from.to_user();
                }
                return n as isize;
            }
            Err(NetError::WouldBlock) if !nonblocking => {
                keel_sched::fiber_yield();
                core::hint::spin_loop();
            }
            Err(e) => return net_errno(e) as isize,
        }
    }
}

pub fn setsockopt(fd: i32, _level: i32, optname: i32, value: i32) -> i32 {
    let result = fd_map::with_fd(fd, |entry| {
        if !entry.is_socket() {
            return -ENOTSOCK;
        }
        match (optname, &entry.kind) {
            (SO_BROADCAST, FdKind::Udp { socket }) => {
                let _ = udp::set_broadcast(*socket, value != 0);
                entry.broadcast = value != 0;
                0
            }
            (SO_BROADCAST, _) => {
                entry.broadcast = value != 0;
                0
            }
            (SO_RCVBUF, FdKind::Udp { socket }) => {
                let _ = udp::set_rcvbuf(*socket, value.max(0) as usize);
                0
            }
            _ => -EOPNOTSUPP,
        }
    });
    match result {
        Ok(rc) => rc,
        Err(e) => e,
    }
}

pub fn shutdown(fd: i32, _how: i32) -> i32 {
    let conn = match fd_map::with_fd(fd, |entry| match entry.kind {
        FdKind::TcpConn { conn } => Ok(conn),
        _ => Err(-ENOTCONN),
    }) {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => return e,
        Err(e) => return e,
    };
    match tcp::close(conn) {
        Ok(()) => 0,
        Err(e) => net_errno(e),
    }
}
