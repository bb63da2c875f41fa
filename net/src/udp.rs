//! UDP sockets.
//!
//! A global port-to-socket map per interface. Delivery is delegate-driven
//! (`recv` callback) or buffered into a bounded queue capped by the
//! socket's `SO_RCVBUF`. Broadcast sends are refused unless `SO_BROADCAST`
//! is set.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use keel_lib::{IrqMutex, klog_debug};

use super::icmp4::IcmpError;
use super::ip4::{self, Direction, DropReason, Ipv4Header};
use super::packetbuf::{PacketBuf, transport_checksum, verify_transport_checksum};
use super::types::{DevIndex, Ipv4Addr, NetError, Port, Socket};
use super::{IPPROTO_UDP, alloc_ephemeral_port};

pub const UDP_HEADER_LEN: usize = 8;

/// Default receive buffer bound (bytes of queued datagram payload).
pub const DEFAULT_RCVBUF: usize = 64 * 1024;

/// Stable handle to an open UDP socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpId(usize);

/// Datagram delivery delegate: `(socket, from, payload)`.
pub type RecvFn = fn(UdpId, Socket, &[u8]);

/// Completion delegate invoked when a datagram has been handed to the
/// device queue.
pub type WriteCompleteFn = fn(UdpId, usize);

struct UdpSocket {
    iface: DevIndex,
    local: Socket,
    remote: Option<Socket>,
    recv_cb: Option<RecvFn>,
    on_write: Option<WriteCompleteFn>,
    queue: VecDeque<(Socket, Vec<u8>)>,
    queued_bytes: usize,
    rcvbuf: usize,
    broadcast: bool,
    pending_error: Option<NetError>,
}

static UDP_SOCKETS: IrqMutex<Vec<Option<UdpSocket>>> = IrqMutex::new(Vec::new());

fn with_socket<R>(id: UdpId, f: impl FnOnce(&mut UdpSocket) -> R) -> Result<R, NetError> {
    let mut sockets = UDP_SOCKETS.lock();
    match sockets.get_mut(id.0).and_then(|slot| slot.as_mut()) {
        Some(socket) => Ok(f(socket)),
        None => Err(NetError::InvalidArgument),
    }
}

// =============================================================================
// Socket lifecycle
// =============================================================================

/// Bind a UDP socket on `iface`. Port 0 allocates an ephemeral port;
/// binding an occupied port fails with `AddressInUse`.
pub fn bind(iface: DevIndex, port: Port) -> Result<UdpId, NetError> {
    let local_ip = super::inet::addr_of(iface).unwrap_or(Ipv4Addr::UNSPECIFIED);
    let mut sockets = UDP_SOCKETS.lock();

    let port = if port.as_u16() == 0 {
        // Ephemeral allocation still has to dodge explicit binds.
        loop {
            let candidate = Port(alloc_ephemeral_port());
            if !port_in_use(&sockets, iface, candidate) {
                break candidate;
            }
        }
    } else {
        if port_in_use(&sockets, iface, port) {
            return Err(NetError::AddressInUse);
        }
        port
    };

    let socket = UdpSocket {
        iface,
        local: Socket::new(local_ip, port),
        remote: None,
        recv_cb: None,
        on_write: None,
        queue: VecDeque::new(),
        queued_bytes: 0,
        rcvbuf: DEFAULT_RCVBUF,
        broadcast: false,
        pending_error: None,
    };

    for (i, slot) in sockets.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(socket);
            return Ok(UdpId(i));
        }
    }
    sockets.push(Some(socket));
    Ok(UdpId(sockets.len() - 1))
}

fn port_in_use(sockets: &[Option<UdpSocket>], iface: DevIndex, port: Port) -> bool {
    sockets.iter().flatten().any(|s| s.iface == iface && s.local.port == port)
}

pub fn close(id: UdpId) {
    let mut sockets = UDP_SOCKETS.lock();
    if let Some(slot) = sockets.get_mut(id.0) {
        *slot = None;
    }
}

/// Fix the default destination (`connect` semantics).
pub fn connect(id: UdpId, remote: Socket) -> Result<(), NetError> {
    with_socket(id, |s| s.remote = Some(remote))
}

pub fn local_endpoint(id: UdpId) -> Result<Socket, NetError> {
    with_socket(id, |s| s.local)
}

pub fn remote_endpoint(id: UdpId) -> Result<Option<Socket>, NetError> {
    with_socket(id, |s| s.remote)
}

/// Register a delivery delegate; queued datagrams are bypassed from then
/// on.
pub fn set_recv_callback(id: UdpId, cb: RecvFn) -> Result<(), NetError> {
    with_socket(id, |s| s.recv_cb = Some(cb))
}

pub fn set_write_complete(id: UdpId, cb: WriteCompleteFn) -> Result<(), NetError> {
    with_socket(id, |s| s.on_write = Some(cb))
}

/// `SO_RCVBUF`: bound on buffered payload bytes.
pub fn set_rcvbuf(id: UdpId, bytes: usize) -> Result<(), NetError> {
    with_socket(id, |s| s.rcvbuf = bytes)
}

/// `SO_BROADCAST`: permit sending to broadcast addresses.
pub fn set_broadcast(id: UdpId, on: bool) -> Result<(), NetError> {
    with_socket(id, |s| s.broadcast = on)
}

/// Bytes queued and readable right now.
pub fn readable_bytes(id: UdpId) -> Result<usize, NetError> {
    with_socket(id, |s| s.queued_bytes)
}

// =============================================================================
// Send
// =============================================================================

/// Send `data` to `dest`, enqueueing one IP packet. The write-completion
/// delegate (if any) fires once the packet is on the device queue.
pub fn sendto(id: UdpId, dest: Socket, data: &[u8]) -> Result<usize, NetError> {
    let (iface, src_port, allowed, on_write) = with_socket(id, |s| {
        (
            s.iface,
            s.local.port,
            s.broadcast || !dest.ip.is_broadcast(),
            s.on_write,
        )
    })?;

    if !allowed {
        return Err(NetError::PermissionDenied);
    }

    let src_ip = super::inet::addr_of(iface).unwrap_or(Ipv4Addr::UNSPECIFIED);
    let mut pkt = PacketBuf::alloc().ok_or(NetError::NoBufferSpace)?;
    pkt.append(data).map_err(|_| NetError::NoBufferSpace)?;

    {
        let header = pkt.push_header(UDP_HEADER_LEN)?;
        header[0..2].copy_from_slice(&src_port.to_network_bytes());
        header[2..4].copy_from_slice(&dest.port.to_network_bytes());
        header[4..6].copy_from_slice(&((UDP_HEADER_LEN + data.len()) as u16).to_be_bytes());
        header[6..8].copy_from_slice(&0u16.to_be_bytes());
    }
    // Checksum over pseudo-header + datagram; RFC 768 encodes zero as
    // 0xFFFF.
    let csum = {
        let segment = pkt.payload();
        let c = transport_checksum(src_ip, dest.ip, IPPROTO_UDP, segment, 6);
        if c == 0 { 0xFFFF } else { c }
    };
    pkt.payload_mut()[6..8].copy_from_slice(&csum.to_be_bytes());

    ip4::ship(iface, dest.ip, IPPROTO_UDP, pkt);

    if let Some(cb) = on_write {
        cb(id, data.len());
    }
    Ok(data.len())
}

/// Send to the connected destination.
pub fn send(id: UdpId, data: &[u8]) -> Result<usize, NetError> {
    let remote = with_socket(id, |s| s.remote)?.ok_or(NetError::NotConnected)?;
    sendto(id, remote, data)
}

// =============================================================================
// Receive
// =============================================================================

/// Dequeue one datagram. `WouldBlock` when nothing is queued; a pending
/// ICMP error surfaces here once and clears.
pub fn recvfrom(id: UdpId, buf: &mut [u8]) -> Result<(usize, Socket), NetError> {
    with_socket(id, |s| {
        if let Some(err) = s.pending_error.take() {
            return Err(err);
        }
        match s.queue.pop_front() {
            Some((from, payload)) => {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                s.queued_bytes -= payload.len();
                Ok((n, from))
            }
            None => Err(NetError::WouldBlock),
        }
    })?
}

// =============================================================================
// Ingress
// =============================================================================

/// Process a UDP datagram whose head sits at the UDP header.
pub fn handle_rx(dev: DevIndex, ip: Ipv4Header, mut pkt: PacketBuf) {
    let segment = pkt.payload();
    if segment.len() < UDP_HEADER_LEN {
        ip4::drop_packet(dev, Direction::Ingress, DropReason::BadLength);
        return;
    }
    let src_port = Port(u16::from_be_bytes([segment[0], segment[1]]));
    let dst_port = Port(u16::from_be_bytes([segment[2], segment[3]]));
    let udp_len = u16::from_be_bytes([segment[4], segment[5]]) as usize;
    let csum = u16::from_be_bytes([segment[6], segment[7]]);

    if udp_len < UDP_HEADER_LEN || udp_len > segment.len() {
        ip4::drop_packet(dev, Direction::Ingress, DropReason::BadLength);
        return;
    }
    // A zero checksum means "not computed" for IPv4 UDP.
    if csum != 0 && !verify_transport_checksum(ip.src, ip.dst, IPPROTO_UDP, &segment[..udp_len]) {
        ip4::drop_packet(dev, Direction::Ingress, DropReason::WrongChecksum);
        return;
    }

    pkt.truncate(udp_len);
    let _ = pkt.pull_header(UDP_HEADER_LEN);
    let from = Socket::new(ip.src, src_port);

    // Match the destination port; the callback runs outside the lock.
    let mut deliver_cb: Option<(UdpId, RecvFn)> = None;
    let mut matched = false;
    {
        let mut sockets = UDP_SOCKETS.lock();
        for (i, slot) in sockets.iter_mut().enumerate() {
            let Some(socket) = slot else { continue };
            if socket.iface != dev || socket.local.port != dst_port {
                continue;
            }
            if let Some(remote) = socket.remote {
                if remote != from {
                    continue;
                }
            }
            matched = true;
            match socket.recv_cb {
                Some(cb) => deliver_cb = Some((UdpId(i), cb)),
                None => {
                    let payload = pkt.payload();
                    if socket.queued_bytes + payload.len() > socket.rcvbuf {
                        klog_debug!("{}: udp rcvbuf full on port {}", dev, dst_port);
                    } else {
                        socket.queued_bytes += payload.len();
                        socket.queue.push_back((from, payload.to_vec()));
                    }
                }
            }
            break;
        }
    }

    if let Some((id, cb)) = deliver_cb {
        cb(id, from, pkt.payload());
        return;
    }
    if !matched {
        // No listener: a port unreachable goes back for unicast.
        if !ip.dst.is_broadcast() && !ip.dst.is_multicast() {
            super::icmp4::send_dest_unreachable(
                dev,
                ip.src,
                super::icmp4::ICMP_CODE_PORT_UNREACHABLE,
                rebuild_quote(&ip, pkt.payload(), src_port, dst_port, udp_len).as_slice(),
            );
        }
    }
}

/// Reconstruct the quoted IP+UDP prefix for an ICMP error. The original IP
/// header was already consumed from the buffer, so it is rebuilt from the
/// parsed fields.
fn rebuild_quote(
    ip: &Ipv4Header,
    payload: &[u8],
    src_port: Port,
    dst_port: Port,
    udp_len: usize,
) -> Vec<u8> {
    let mut quote = Vec::with_capacity(super::icmp4::ICMP_QUOTE_LEN);
    let mut header = [0u8; super::IPV4_HEADER_LEN];
    ip4::write_header(
        &mut header,
        ip.src,
        ip.dst,
        IPPROTO_UDP,
        udp_len,
        ip.ttl,
    );
    quote.extend_from_slice(&header);
    quote.extend_from_slice(&src_port.to_network_bytes());
    quote.extend_from_slice(&dst_port.to_network_bytes());
    quote.extend_from_slice(&(udp_len as u16).to_be_bytes());
    quote.extend_from_slice(&0u16.to_be_bytes());
    let _ = payload;
    quote
}

// =============================================================================
// Error routing
// =============================================================================

/// ICMP error concerning a datagram we sent from `original_src`.
pub fn error_report(iface: DevIndex, original_src: Socket, original_dst: Socket, err: IcmpError) {
    let error = if err.is_too_big() {
        // PMTU was already updated by the inet layer; UDP callers learn on
        // their next receive.
        NetError::NoBufferSpace
    } else if err.is_fatal() {
        NetError::ConnectionRefused
    } else {
        NetError::HostUnreachable
    };

    let mut sockets = UDP_SOCKETS.lock();
    for slot in sockets.iter_mut() {
        let Some(socket) = slot else { continue };
        if socket.iface == iface && socket.local.port == original_src.port {
            if let Some(remote) = socket.remote {
                if remote != original_dst {
                    continue;
                }
            }
            socket.pending_error = Some(error);
        }
    }
}

/// Release every socket (test teardown).
pub fn reset_all() {
    UDP_SOCKETS.lock().clear();
}
