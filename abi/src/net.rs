//! Socket ABI shared between the network stack and the POSIX layer.
//!
//! The layouts mirror the classic BSD `sockaddr_in` family so that the
//! emulated socket calls can exchange addresses with application code
//! compiled against a libc-shaped interface.

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;

pub const O_NONBLOCK: i32 = 0o4000;

pub const SHUT_RD: i32 = 0;
pub const SHUT_WR: i32 = 1;
pub const SHUT_RDWR: i32 = 2;

/// IPv4 socket address, `sockaddr_in` layout.
///
/// `port` and `addr` are stored in network byte order.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SockAddrIn {
    pub family: u16,
    pub port: u16,
    pub addr: [u8; 4],
    pub _pad: [u8; 8],
}

/// IPv6 socket address, `sockaddr_in6` layout (no flow label support).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SockAddrIn6 {
    pub family: u16,
    pub port: u16,
    pub flowinfo: u32,
    pub addr: [u8; 16],
    pub scope_id: u32,
}

// Socket option levels and names understood by the emulated setsockopt.
pub const SOL_SOCKET: i32 = 1;
pub const SO_REUSEADDR: i32 = 2;
pub const SO_BROADCAST: i32 = 6;
pub const SO_RCVBUF: i32 = 8;
