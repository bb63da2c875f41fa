//! ICMPv6 and neighbor discovery.
//!
//! This module owns the IPv6 equivalent of the ARP cache: neighbor
//! solicitation goes out to the target's solicited-node multicast group,
//! advertisements fill the cache, and parked packets drain on resolution.
//! Echo and Packet Too Big are handled alongside, since ICMPv6 carries
//! both the discovery and the error machinery.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use keel_lib::{clock, klog_debug};

use super::inet::with_inet;
use super::packetbuf::PacketBuf;
use super::types::{DevIndex, Ipv6Addr, MacAddr};
use super::{ETH_ADDR_LEN, IPPROTO_ICMPV6, fold_checksum, ones_complement_sum};

pub const ICMP6_PACKET_TOO_BIG: u8 = 2;
pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;
pub const ICMP6_NEIGHBOR_SOLICITATION: u8 = 135;
pub const ICMP6_NEIGHBOR_ADVERTISEMENT: u8 = 136;

pub const ICMP6_HEADER_LEN: usize = 4;

/// NDP option: source/target link-layer address.
const NDP_OPT_SOURCE_LLADDR: u8 = 1;
const NDP_OPT_TARGET_LLADDR: u8 = 2;

const NEIGHBOR_TTL_S: u64 = 60;
const NEIGHBOR_PENDING_LIMIT: usize = 8;

// =============================================================================
// Checksum
// =============================================================================

/// ICMPv6 checksum over the IPv6 pseudo-header and the message.
pub fn checksum(src: Ipv6Addr, dst: Ipv6Addr, message: &[u8]) -> u16 {
    let mut sum = 0u32;
    for pair in src.0.chunks(2) {
        sum = sum.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]) as u32);
    }
    for pair in dst.0.chunks(2) {
        sum = sum.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]) as u32);
    }
    sum = sum.wrapping_add(message.len() as u32);
    sum = sum.wrapping_add(IPPROTO_ICMPV6 as u32);
    sum = sum.wrapping_add(ones_complement_sum(message));
    fold_checksum(sum)
}

fn finalize_checksum(src: Ipv6Addr, dst: Ipv6Addr, message: &mut [u8]) {
    message[2] = 0;
    message[3] = 0;
    let csum = checksum(src, dst, message);
    message[2..4].copy_from_slice(&csum.to_be_bytes());
}

// =============================================================================
// Neighbor cache
// =============================================================================

#[derive(Clone, Copy, Debug)]
struct Neighbor {
    mac: MacAddr,
    deadline_s: u64,
}

/// Single-writer IPv6 neighbor cache (owned by one `Inet`).
pub struct NeighborCache6 {
    entries: BTreeMap<Ipv6Addr, Neighbor>,
    pending: BTreeMap<Ipv6Addr, Vec<PacketBuf>>,
    ttl_s: u64,
}

impl NeighborCache6 {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            pending: BTreeMap::new(),
            ttl_s: NEIGHBOR_TTL_S,
        }
    }

    pub fn lookup(&self, addr: Ipv6Addr, now_s: u64) -> Option<MacAddr> {
        let entry = self.entries.get(&addr)?;
        if entry.deadline_s <= now_s {
            return None;
        }
        Some(entry.mac)
    }

    /// Record an advertisement, returning parked packets ready to send.
    pub fn insert(&mut self, addr: Ipv6Addr, mac: MacAddr, now_s: u64) -> Vec<PacketBuf> {
        self.entries.insert(
            addr,
            Neighbor {
                mac,
                deadline_s: now_s + self.ttl_s,
            },
        );
        let mut ready = self.pending.remove(&addr).unwrap_or_default();
        for pkt in ready.iter_mut() {
            let data = pkt.payload_mut();
            if data.len() >= ETH_ADDR_LEN {
                data[..ETH_ADDR_LEN].copy_from_slice(&mac.0);
            }
        }
        ready
    }

    /// Park a packet; `true` when a solicitation should go out.
    pub fn queue_pending(&mut self, addr: Ipv6Addr, pkt: PacketBuf) -> bool {
        let queue = self.pending.entry(addr).or_default();
        let first = queue.is_empty();
        if queue.len() >= NEIGHBOR_PENDING_LIMIT {
            queue.remove(0);
        }
        queue.push(pkt);
        first
    }

    pub fn flush_expired(&mut self, now_s: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.deadline_s > now_s);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for NeighborCache6 {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Ingress
// =============================================================================

/// Process an ICMPv6 message whose head sits at its header.
pub fn handle_rx(dev: DevIndex, ip: super::ip6::Ipv6Header, mut pkt: PacketBuf) {
    let data = pkt.payload();
    if data.len() < ICMP6_HEADER_LEN {
        return;
    }
    if checksum(ip.src, ip.dst, data) != 0 {
        klog_debug!("{}: icmpv6 checksum mismatch", dev);
        return;
    }

    match data[0] {
        ICMP6_NEIGHBOR_SOLICITATION => handle_solicitation(dev, ip, &pkt),
        ICMP6_NEIGHBOR_ADVERTISEMENT => handle_advertisement(dev, &pkt),
        ICMP6_ECHO_REQUEST => {
            {
                let data = pkt.payload_mut();
                data[0] = ICMP6_ECHO_REPLY;
            }
            let (src, dst) = (ip.dst, ip.src);
            {
                let data = pkt.payload_mut();
                finalize_checksum(src, dst, data);
            }
            super::ip6::ship(dev, ip.src, IPPROTO_ICMPV6, pkt);
        }
        ICMP6_PACKET_TOO_BIG => {
            let mtu = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            klog_debug!("{}: icmpv6 packet too big, mtu {}", dev, mtu);
            // The v6 transports are not wired; nothing further to notify.
        }
        _ => {}
    }
}

fn handle_solicitation(dev: DevIndex, ip: super::ip6::Ipv6Header, pkt: &PacketBuf) {
    let data = pkt.payload();
    // Type(1) code(1) csum(2) reserved(4) target(16).
    if data.len() < 24 {
        return;
    }
    let mut target = [0u8; 16];
    target.copy_from_slice(&data[8..24]);
    let target = Ipv6Addr(target);

    let now = clock::wall_s();
    let (is_ours, our_mac) = match with_inet(dev, |inet| {
        // The solicitation's source lladdr option refreshes our cache.
        if let Some(mac) = parse_lladdr_option(&data[24..], NDP_OPT_SOURCE_LLADDR) {
            for pkt in inet.neighbors6.insert(ip.src, mac, now) {
                let _ = super::netdev::DEVICE_REGISTRY.transmit(inet.iface, pkt);
            }
        }
        (target == inet.cfg.addr6 && !target.is_unspecified(), inet.mac)
    }) {
        Some(pair) => pair,
        None => return,
    };

    if is_ours {
        send_advertisement(dev, target, our_mac, ip.src);
    }
}

fn handle_advertisement(dev: DevIndex, pkt: &PacketBuf) {
    let data = pkt.payload();
    if data.len() < 24 {
        return;
    }
    let mut target = [0u8; 16];
    target.copy_from_slice(&data[8..24]);
    let target = Ipv6Addr(target);

    let Some(mac) = parse_lladdr_option(&data[24..], NDP_OPT_TARGET_LLADDR) else {
        return;
    };

    let now = clock::wall_s();
    let ready = with_inet(dev, |inet| inet.neighbors6.insert(target, mac, now));
    if let Some(ready) = ready {
        for pkt in ready {
            let _ = super::netdev::DEVICE_REGISTRY.transmit(dev, pkt);
        }
    }
}

fn parse_lladdr_option(mut options: &[u8], wanted: u8) -> Option<MacAddr> {
    while options.len() >= 8 {
        let opt_type = options[0];
        let opt_len = options[1] as usize * 8;
        if opt_len == 0 || opt_len > options.len() {
            return None;
        }
        if opt_type == wanted && opt_len >= 8 {
            return Some(MacAddr([
                options[2], options[3], options[4], options[5], options[6], options[7],
            ]));
        }
        options = &options[opt_len..];
    }
    None
}

// =============================================================================
// Egress
// =============================================================================

/// Ship an IPv6 packet (IPv6 header present, Ethernet not) toward `dst`,
/// resolving through the neighbor cache. A miss parks the packet behind a
/// neighbor solicitation to the solicited-node multicast group.
pub fn resolve_and_ship(dev: DevIndex, mut pkt: PacketBuf, dst: Ipv6Addr) {
    let now = clock::wall_s();

    enum Action {
        Transmit(PacketBuf),
        Solicit,
        Dropped,
    }

    let action = match with_inet(dev, |inet| {
        match inet.neighbors6.lookup(dst, now) {
            Some(mac) => {
                if super::ethernet::push_frame_header(&mut pkt, mac, inet.mac, super::ETHERTYPE_IPV6)
                    .is_err()
                {
                    return Action::Dropped;
                }
                Action::Transmit(pkt)
            }
            None => {
                if super::ethernet::push_frame_header(
                    &mut pkt,
                    MacAddr::ZERO,
                    inet.mac,
                    super::ETHERTYPE_IPV6,
                )
                .is_err()
                {
                    return Action::Dropped;
                }
                if inet.neighbors6.queue_pending(dst, pkt) {
                    Action::Solicit
                } else {
                    Action::Dropped
                }
            }
        }
    }) {
        Some(action) => action,
        None => return,
    };

    match action {
        Action::Transmit(frame) => {
            let _ = super::netdev::DEVICE_REGISTRY.transmit(dev, frame);
        }
        Action::Solicit => send_solicitation(dev, dst),
        Action::Dropped => {}
    }
}

/// Send a neighbor solicitation for `target` to its solicited-node group.
pub fn send_solicitation(dev: DevIndex, target: Ipv6Addr) {
    let Some((our_mac, our_addr)) = with_inet(dev, |inet| (inet.mac, inet.cfg.addr6)) else {
        return;
    };
    let Some(mut pkt) = PacketBuf::alloc() else {
        return;
    };

    let mut msg = [0u8; 32];
    msg[0] = ICMP6_NEIGHBOR_SOLICITATION;
    msg[8..24].copy_from_slice(&target.0);
    msg[24] = NDP_OPT_SOURCE_LLADDR;
    msg[25] = 1;
    msg[26..32].copy_from_slice(&our_mac.0);

    let group = target.solicited_node();
    finalize_checksum(our_addr, group, &mut msg);
    if pkt.append(&msg).is_err() {
        return;
    }
    super::ip6::ship(dev, group, IPPROTO_ICMPV6, pkt);
}

/// Send a neighbor advertisement for `target` to `to`.
pub fn send_advertisement(dev: DevIndex, target: Ipv6Addr, our_mac: MacAddr, to: Ipv6Addr) {
    let Some(our_addr) = with_inet(dev, |inet| inet.cfg.addr6) else {
        return;
    };
    let Some(mut pkt) = PacketBuf::alloc() else {
        return;
    };

    let mut msg = [0u8; 32];
    msg[0] = ICMP6_NEIGHBOR_ADVERTISEMENT;
    // Solicited + override flags.
    msg[4] = 0x60;
    msg[8..24].copy_from_slice(&target.0);
    msg[24] = NDP_OPT_TARGET_LLADDR;
    msg[25] = 1;
    msg[26..32].copy_from_slice(&our_mac.0);

    finalize_checksum(our_addr, to, &mut msg);
    if pkt.append(&msg).is_err() {
        return;
    }
    super::ip6::ship(dev, to, IPPROTO_ICMPV6, pkt);
}
