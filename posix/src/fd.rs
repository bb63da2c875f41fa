//! Descriptor kinds.
//!
//! A descriptor either fronts a network socket (listening TCP, connected
//! TCP, UDP), an open file resolved through the VFS, or the RNG device.
//! The table in [`super::fd_map`] owns these; the calls in
//! [`super::unistd`] and [`super::sockcalls`] dispatch on the kind.

use keel_fs::Dirent;
use keel_net::tcp::ConnId;
use keel_net::types::{DevIndex, Port, Socket};
use keel_net::udp::UdpId;

pub enum FdKind {
    /// A TCP socket that has not been bound/connected yet.
    TcpUnbound,
    /// A listening TCP socket.
    TcpListener { port: Port },
    /// An established (or connecting) TCP connection.
    TcpConn { conn: ConnId },
    /// A UDP socket.
    Udp { socket: UdpId },
    /// An open file with a cursor.
    File { dirent: Dirent, offset: u64 },
    /// `/dev/random` and `/dev/urandom`.
    Random,
}

pub struct FdEntry {
    pub kind: FdKind,
    /// The interface socket calls operate on.
    pub iface: DevIndex,
    /// `O_NONBLOCK`.
    pub nonblocking: bool,
    /// `SO_BROADCAST` parked here until the socket materialises.
    pub broadcast: bool,
    /// Local address fixed by `bind`, consumed by `listen`/`connect`.
    pub bound: Option<Socket>,
}

impl FdEntry {
    pub fn new(kind: FdKind, iface: DevIndex) -> Self {
        Self {
            kind,
            iface,
            nonblocking: false,
            broadcast: false,
            bound: None,
        }
    }

    pub fn is_socket(&self) -> bool {
        matches!(
            self.kind,
            FdKind::TcpUnbound
                | FdKind::TcpListener { .. }
                | FdKind::TcpConn { .. }
                | FdKind::Udp { .. }
        )
    }
}
