//! IPv4: header validation, demux, egress, forwarding handoff.
//!
//! Every ingress drop has a typed [`DropReason`]; the interface's counters
//! and drop delegate see each drop exactly once. Packets surviving
//! validation demux by protocol to ICMP, UDP or TCP — passing conntrack on
//! the way — or hand off to the router when addressed elsewhere and
//! forwarding is enabled.

use keel_lib::clock;

use super::conntrack::Quadruple;
use super::icmp4;
use super::inet::{self, with_inet};
use super::packetbuf::PacketBuf;
use super::types::{DevIndex, IpProtocol, Ipv4Addr, Port, Socket};
use super::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, IPV4_HEADER_LEN, ones_complement_checksum};

pub const DEFAULT_TTL: u8 = 64;

/// Why a packet was dropped. Counted per interface and handed to the drop
/// delegate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    WrongVersion,
    WrongChecksum,
    BadSource,
    BadDestination,
    UnknownProto,
    Ttl0,
    BadLength,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

// =============================================================================
// Header
// =============================================================================

#[derive(Clone, Copy, Debug)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in bytes (IHL × 4).
    pub header_len: usize,
    pub dscp_ecn: u8,
    pub total_len: u16,
    pub id: u16,
    pub flags_frag: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// Parse the header at `data` without consuming it. Options are accepted
/// for length accounting but never interpreted.
pub fn parse_header(data: &[u8]) -> Option<Ipv4Header> {
    if data.len() < IPV4_HEADER_LEN {
        return None;
    }
    let version = data[0] >> 4;
    let header_len = ((data[0] & 0x0F) as usize) * 4;
    if header_len < IPV4_HEADER_LEN || data.len() < header_len {
        return None;
    }
    Some(Ipv4Header {
        version,
        header_len,
        dscp_ecn: data[1],
        total_len: u16::from_be_bytes([data[2], data[3]]),
        id: u16::from_be_bytes([data[4], data[5]]),
        flags_frag: u16::from_be_bytes([data[6], data[7]]),
        ttl: data[8],
        protocol: data[9],
        checksum: u16::from_be_bytes([data[10], data[11]]),
        src: Ipv4Addr([data[12], data[13], data[14], data[15]]),
        dst: Ipv4Addr([data[16], data[17], data[18], data[19]]),
    })
}

/// Write a 20-byte header (no options) with a correct checksum.
pub fn write_header(
    out: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload_len: usize,
    ttl: u8,
) {
    debug_assert!(out.len() >= IPV4_HEADER_LEN);
    let total_len = (IPV4_HEADER_LEN + payload_len) as u16;
    out[0] = 0x45; // version 4, IHL 5
    out[1] = 0;
    out[2..4].copy_from_slice(&total_len.to_be_bytes());
    out[4..6].copy_from_slice(&0u16.to_be_bytes());
    out[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
    out[8] = ttl;
    out[9] = protocol;
    out[10] = 0;
    out[11] = 0;
    out[12..16].copy_from_slice(&src.0);
    out[16..20].copy_from_slice(&dst.0);
    let csum = ones_complement_checksum(&out[..IPV4_HEADER_LEN]);
    out[10..12].copy_from_slice(&csum.to_be_bytes());
}

/// Verify the header checksum (sum over the header folds to zero).
pub fn verify_checksum(header: &[u8]) -> bool {
    ones_complement_checksum(header) == 0
}

// =============================================================================
// Source policy
// =============================================================================

/// Whether a `0.0.0.0` source is acceptable for this destination.
///
/// A host without an address yet may speak — but only to the limited
/// broadcast address. This is the DHCP DISCOVER/REQUEST path; everything
/// else with a zero source is a martian.
pub fn zero_source_allowed(dst: Ipv4Addr) -> bool {
    dst.is_broadcast()
}

// =============================================================================
// Drop bookkeeping
// =============================================================================

pub(crate) fn drop_packet(dev: DevIndex, direction: Direction, reason: DropReason) {
    let handler = with_inet(dev, |inet| {
        inet.counters.bump(reason);
        inet.drop_handler
    });
    if let Some(handler) = handler {
        handler(dev, direction, reason);
    }
}

// =============================================================================
// Ingress
// =============================================================================

/// Process one IPv4 packet whose head sits at the IP header.
pub fn handle_rx(dev: DevIndex, mut pkt: PacketBuf) {
    let l3_offset = pkt.head();
    pkt.set_l3(l3_offset);

    let Some(header) = parse_header(pkt.payload()) else {
        drop_packet(dev, Direction::Ingress, DropReason::BadLength);
        return;
    };

    if header.version != 4 {
        drop_packet(dev, Direction::Ingress, DropReason::WrongVersion);
        return;
    }
    if (header.total_len as usize) < header.header_len || (header.total_len as usize) > pkt.len() {
        drop_packet(dev, Direction::Ingress, DropReason::BadLength);
        return;
    }
    if !verify_checksum(&pkt.payload()[..header.header_len]) {
        drop_packet(dev, Direction::Ingress, DropReason::WrongChecksum);
        return;
    }

    // Trim link-layer padding below the IP total length.
    pkt.truncate(header.total_len as usize);

    // Martian sources. The zero source is tolerated only on the DHCP path.
    let (is_local, own_subnet_bcast) = match with_inet(dev, |inet| {
        (
            inet.accepts(header.dst),
            inet.cfg.addr.subnet_broadcast(inet.cfg.netmask),
        )
    }) {
        Some(pair) => pair,
        None => return,
    };

    let bad_source = (header.src.is_unspecified() && !zero_source_allowed(header.dst))
        || header.src.is_broadcast()
        || header.src.is_multicast()
        || (!header.src.is_unspecified() && header.src == own_subnet_bcast);
    if bad_source {
        drop_packet(dev, Direction::Ingress, DropReason::BadSource);
        return;
    }

    if !is_local && !header.dst.is_multicast() {
        let forwarding = with_inet(dev, |inet| inet.forwarding).unwrap_or(false);
        if !forwarding {
            drop_packet(dev, Direction::Ingress, DropReason::BadDestination);
            return;
        }
        super::router::forward(dev, pkt, header);
        return;
    }

    // Record the transport offset and consume the IP header.
    pkt.set_l4(l3_offset + header.header_len as u16);
    let _ = pkt.pull_header(header.header_len);

    // Conntrack sees every tracked ingress packet before its transport.
    let ct_id = track_ingress(dev, &header, pkt.payload());

    match header.protocol {
        IPPROTO_ICMP => icmp4::handle_rx(dev, header, pkt),
        IPPROTO_UDP => super::udp::handle_rx(dev, header, pkt),
        IPPROTO_TCP => super::tcp::handle_rx(dev, header, pkt, ct_id),
        _ => drop_packet(dev, Direction::Ingress, DropReason::UnknownProto),
    }
}

fn track_ingress(
    dev: DevIndex,
    header: &Ipv4Header,
    l4: &[u8],
) -> Option<super::conntrack::CtId> {
    let proto = IpProtocol::from_u8(header.protocol)?;
    let quad = match proto {
        IpProtocol::Tcp | IpProtocol::Udp => {
            if l4.len() < 4 {
                return None;
            }
            Quadruple::new(
                Socket::new(header.src, Port(u16::from_be_bytes([l4[0], l4[1]]))),
                Socket::new(header.dst, Port(u16::from_be_bytes([l4[2], l4[3]]))),
            )
        }
        IpProtocol::Icmp => {
            // Echo id stands in for the port pair.
            if l4.len() < 6 {
                return None;
            }
            let id = Port(u16::from_be_bytes([l4[4], l4[5]]));
            Quadruple::new(Socket::new(header.src, id), Socket::new(header.dst, id))
        }
        IpProtocol::Icmpv6 => return None,
    };

    let ct = with_inet(dev, |inet| inet.conntrack.clone())?;
    let now = clock::wall_s();
    ct.lock().in_(quad, proto, now)
}

// =============================================================================
// Egress
// =============================================================================

/// Prepend an IPv4 header onto `pkt` (whose head sits at the transport
/// header) and ship it via ARP resolution on `dev`.
pub fn ship(dev: DevIndex, dst: Ipv4Addr, protocol: u8, mut pkt: PacketBuf) {
    let payload_len = pkt.len();
    let src = match with_inet(dev, |inet| inet.cfg.addr) {
        Some(addr) => addr,
        None => return,
    };

    {
        let Ok(header) = pkt.push_header(IPV4_HEADER_LEN) else {
            drop_packet(dev, Direction::Egress, DropReason::BadLength);
            return;
        };
        write_header(header, src, dst, protocol, payload_len, DEFAULT_TTL);
    }
    let l3 = pkt.head();
    pkt.set_l3(l3);
    pkt.set_l4(l3 + IPV4_HEADER_LEN as u16);

    let next_hop = match with_inet(dev, |inet| inet.next_hop(dst)) {
        Some(hop) => hop,
        None => return,
    };
    inet::resolve_and_ship(dev, pkt, next_hop, super::ETHERTYPE_IPV4);
}

/// Ship a packet that already carries its IP header (the forwarding path)
/// toward an explicit next hop on `dev`.
pub fn ship_forward(dev: DevIndex, pkt: PacketBuf, next_hop: Ipv4Addr) {
    inet::resolve_and_ship(dev, pkt, next_hop, super::ETHERTYPE_IPV4);
}

/// Decrement the TTL of the IP header at the packet's head, fixing up the
/// checksum incrementally (RFC 1141).
pub fn decrement_ttl(pkt: &mut PacketBuf) {
    let data = pkt.payload_mut();
    if data.len() < IPV4_HEADER_LEN || data[8] == 0 {
        return;
    }
    data[8] -= 1;
    // Incremental checksum update: adding 0x0100 to the checksum
    // compensates for subtracting one from the TTL byte.
    let old = u16::from_be_bytes([data[10], data[11]]);
    let (mut sum, overflow) = old.overflowing_add(0x0100);
    if overflow {
        sum = sum.wrapping_add(1);
    }
    data[10..12].copy_from_slice(&sum.to_be_bytes());
}
