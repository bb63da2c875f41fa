//! IPv6: fixed-header validation, extension-header walk, ICMPv6 demux and
//! egress through neighbor discovery.
//!
//! IPv6 has no header checksum; validation covers version, length, source
//! class and hop limit. Extension headers are walked until a terminal
//! protocol is found. Transports beyond ICMPv6 currently count as
//! `UnknownProto` — the socket layers speak IPv4.

use super::icmp6;
use super::inet::{self, with_inet};
use super::ip4::{Direction, DropReason, drop_packet};
use super::packetbuf::PacketBuf;
use super::types::{DevIndex, Ipv6Addr, MacAddr};
use super::{IPPROTO_ICMPV6, IPV6_HEADER_LEN};

pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// Next-header values for extension headers we walk through.
pub const EXT_HOP_BY_HOP: u8 = 0;
pub const EXT_ROUTING: u8 = 43;
pub const EXT_DEST_OPTS: u8 = 60;
pub const EXT_NO_NEXT: u8 = 59;

/// All-nodes link-local multicast (`ff02::1`).
pub const ALL_NODES: Ipv6Addr = Ipv6Addr([0xFF, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

#[derive(Clone, Copy, Debug)]
pub struct Ipv6Header {
    pub version: u8,
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

pub fn parse_header(data: &[u8]) -> Option<Ipv6Header> {
    if data.len() < IPV6_HEADER_LEN {
        return None;
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    dst.copy_from_slice(&data[24..40]);
    Some(Ipv6Header {
        version: data[0] >> 4,
        payload_len: u16::from_be_bytes([data[4], data[5]]),
        next_header: data[6],
        hop_limit: data[7],
        src: Ipv6Addr(src),
        dst: Ipv6Addr(dst),
    })
}

pub fn write_header(
    out: &mut [u8],
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: u8,
    payload_len: u16,
    hop_limit: u8,
) {
    debug_assert!(out.len() >= IPV6_HEADER_LEN);
    out[0] = 0x60;
    out[1] = 0;
    out[2] = 0;
    out[3] = 0;
    out[4..6].copy_from_slice(&payload_len.to_be_bytes());
    out[6] = next_header;
    out[7] = hop_limit;
    out[8..24].copy_from_slice(&src.0);
    out[24..40].copy_from_slice(&dst.0);
}

/// Walk extension headers starting at `next_header`, returning the terminal
/// protocol and the offset of its data within `payload`.
pub fn walk_extensions(mut next_header: u8, payload: &[u8]) -> Option<(u8, usize)> {
    let mut offset = 0usize;
    loop {
        match next_header {
            EXT_HOP_BY_HOP | EXT_ROUTING | EXT_DEST_OPTS => {
                if payload.len() < offset + 8 {
                    return None;
                }
                let hdr_ext_len = payload[offset + 1] as usize;
                let this_len = 8 + hdr_ext_len * 8;
                next_header = payload[offset];
                offset += this_len;
                if offset > payload.len() {
                    return None;
                }
            }
            EXT_NO_NEXT => return None,
            terminal => return Some((terminal, offset)),
        }
    }
}

/// Process one IPv6 packet whose head sits at the fixed header.
pub fn handle_rx(dev: DevIndex, mut pkt: PacketBuf) {
    let l3_offset = pkt.head();
    pkt.set_l3(l3_offset);

    let Some(header) = parse_header(pkt.payload()) else {
        drop_packet(dev, Direction::Ingress, DropReason::BadLength);
        return;
    };
    if header.version != 6 {
        drop_packet(dev, Direction::Ingress, DropReason::WrongVersion);
        return;
    }
    if IPV6_HEADER_LEN + header.payload_len as usize > pkt.len() {
        drop_packet(dev, Direction::Ingress, DropReason::BadLength);
        return;
    }
    if header.src.is_multicast() {
        drop_packet(dev, Direction::Ingress, DropReason::BadSource);
        return;
    }

    let ours = match with_inet(dev, |inet| {
        let own = inet.cfg.addr6;
        header.dst == own
            || header.dst == own.solicited_node()
            || header.dst == ALL_NODES
            || (own.is_unspecified() && header.dst.is_multicast())
    }) {
        Some(ours) => ours,
        None => return,
    };
    if !ours {
        drop_packet(dev, Direction::Ingress, DropReason::BadDestination);
        return;
    }

    if header.hop_limit == 0 {
        drop_packet(dev, Direction::Ingress, DropReason::Ttl0);
        return;
    }

    let _ = pkt.pull_header(IPV6_HEADER_LEN);
    let (terminal, ext_len) = match walk_extensions(header.next_header, pkt.payload()) {
        Some(found) => found,
        None => return,
    };
    if ext_len > 0 && pkt.pull_header(ext_len).is_err() {
        return;
    }
    let l4 = pkt.head();
    pkt.set_l4(l4);

    match terminal {
        IPPROTO_ICMPV6 => icmp6::handle_rx(dev, header, pkt),
        _ => drop_packet(dev, Direction::Ingress, DropReason::UnknownProto),
    }
}

/// Prepend an IPv6 header and ship via neighbor discovery.
pub fn ship(dev: DevIndex, dst: Ipv6Addr, next_header: u8, mut pkt: PacketBuf) {
    let payload_len = pkt.len() as u16;
    let src = match with_inet(dev, |inet| inet.cfg.addr6) {
        Some(addr) => addr,
        None => return,
    };

    {
        let Ok(header) = pkt.push_header(IPV6_HEADER_LEN) else {
            return;
        };
        write_header(header, src, dst, next_header, payload_len, DEFAULT_HOP_LIMIT);
    }
    let l3 = pkt.head();
    pkt.set_l3(l3);

    if dst.is_multicast() {
        // Multicast maps straight onto the MAC layer — no discovery.
        let mac = MacAddr::for_v6_multicast(dst);
        let our_mac = match inet::mac_of(dev) {
            Some(mac) => mac,
            None => return,
        };
        if super::ethernet::push_frame_header(&mut pkt, mac, our_mac, super::ETHERTYPE_IPV6)
            .is_ok()
        {
            let _ = super::netdev::DEVICE_REGISTRY.transmit(dev, pkt);
        }
        return;
    }

    icmp6::resolve_and_ship(dev, pkt, dst);
}
