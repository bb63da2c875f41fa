//! ARP — RFC 826 cache and request/reply processing for Ethernet/IPv4.
//!
//! The cache maps `Ipv4Addr → (MacAddr, deadline)`; a periodic flush timer
//! evicts stale entries. Outgoing packets that miss the cache are parked on
//! a bounded per-destination queue behind a single ARP request; the reply
//! drains the queue. A pluggable policy delegate enables proxy ARP.
//!
//! Cache methods never transmit — they return work for the caller to
//! perform outside the `Inet` lock.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use keel_lib::klog_debug;

use super::packetbuf::PacketBuf;
use super::types::{Ipv4Addr, MacAddr};
use super::{
    ARP_HEADER_LEN, ARP_HLEN_ETHERNET, ARP_HTYPE_ETHERNET, ARP_OPER_REPLY, ARP_OPER_REQUEST,
    ARP_PLEN_IPV4, ARP_PTYPE_IPV4, ETH_ADDR_LEN,
};

/// Cache entry lifetime in seconds.
pub const ARP_CACHE_TTL_S: u64 = 60;

/// Flush timer period in seconds.
pub const ARP_FLUSH_INTERVAL_S: u64 = 5;

/// Per-destination cap on packets parked behind an unresolved request.
pub const ARP_PENDING_LIMIT: usize = 8;

// =============================================================================
// Wire format
// =============================================================================

#[derive(Clone, Copy, Debug)]
pub struct ArpFrame {
    pub oper: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

/// Parse an ARP payload (Ethernet header already consumed). Rejects
/// anything that is not Ethernet/IPv4 ARP.
pub fn parse(data: &[u8]) -> Option<ArpFrame> {
    if data.len() < ARP_HEADER_LEN {
        return None;
    }
    let htype = u16::from_be_bytes([data[0], data[1]]);
    let ptype = u16::from_be_bytes([data[2], data[3]]);
    if htype != ARP_HTYPE_ETHERNET
        || ptype != ARP_PTYPE_IPV4
        || data[4] != ARP_HLEN_ETHERNET
        || data[5] != ARP_PLEN_IPV4
    {
        return None;
    }
    Some(ArpFrame {
        oper: u16::from_be_bytes([data[6], data[7]]),
        sender_mac: MacAddr([data[8], data[9], data[10], data[11], data[12], data[13]]),
        sender_ip: Ipv4Addr([data[14], data[15], data[16], data[17]]),
        target_mac: MacAddr([data[18], data[19], data[20], data[21], data[22], data[23]]),
        target_ip: Ipv4Addr([data[24], data[25], data[26], data[27]]),
    })
}

fn write_payload(
    oper: u16,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> [u8; ARP_HEADER_LEN] {
    let mut out = [0u8; ARP_HEADER_LEN];
    out[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    out[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    out[4] = ARP_HLEN_ETHERNET;
    out[5] = ARP_PLEN_IPV4;
    out[6..8].copy_from_slice(&oper.to_be_bytes());
    out[8..14].copy_from_slice(&sender_mac.0);
    out[14..18].copy_from_slice(&sender_ip.0);
    out[18..24].copy_from_slice(&target_mac.0);
    out[24..28].copy_from_slice(&target_ip.0);
    out
}

/// Build a broadcast ARP request frame (Ethernet header included).
pub fn build_request(our_mac: MacAddr, our_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Option<PacketBuf> {
    let mut pkt = PacketBuf::alloc()?;
    let payload = write_payload(ARP_OPER_REQUEST, our_mac, our_ip, MacAddr::ZERO, target_ip);
    pkt.append(&payload).ok()?;
    super::ethernet::push_frame_header(&mut pkt, MacAddr::BROADCAST, our_mac, super::ETHERTYPE_ARP)
        .ok()?;
    Some(pkt)
}

/// Build a unicast ARP reply frame.
pub fn build_reply(
    our_mac: MacAddr,
    our_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Option<PacketBuf> {
    let mut pkt = PacketBuf::alloc()?;
    let payload = write_payload(ARP_OPER_REPLY, our_mac, our_ip, target_mac, target_ip);
    pkt.append(&payload).ok()?;
    super::ethernet::push_frame_header(&mut pkt, target_mac, our_mac, super::ETHERTYPE_ARP).ok()?;
    Some(pkt)
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Clone, Copy, Debug)]
struct ArpEntry {
    mac: MacAddr,
    deadline_s: u64,
}

/// Pluggable proxy-ARP policy: answer requests for addresses that are not
/// our own when the delegate approves.
pub type ProxyArpFn = fn(Ipv4Addr) -> bool;

/// Single-writer ARP cache (owned by one `Inet`).
pub struct ArpCache {
    entries: BTreeMap<Ipv4Addr, ArpEntry>,
    /// Packets parked behind an in-flight resolution, per destination.
    pending: BTreeMap<Ipv4Addr, Vec<PacketBuf>>,
    proxy_policy: Option<ProxyArpFn>,
    ttl_s: u64,
}

impl ArpCache {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            pending: BTreeMap::new(),
            proxy_policy: None,
            ttl_s: ARP_CACHE_TTL_S,
        }
    }

    pub fn set_proxy_policy(&mut self, policy: ProxyArpFn) {
        self.proxy_policy = Some(policy);
    }

    pub fn proxy_allows(&self, addr: Ipv4Addr) -> bool {
        self.proxy_policy.map(|p| p(addr)).unwrap_or(false)
    }

    pub fn set_ttl_s(&mut self, ttl: u64) {
        self.ttl_s = ttl;
    }

    /// Resolve `ip`, refusing entries past their deadline.
    pub fn lookup(&self, ip: Ipv4Addr, now_s: u64) -> Option<MacAddr> {
        let entry = self.entries.get(&ip)?;
        if entry.deadline_s <= now_s {
            return None;
        }
        Some(entry.mac)
    }

    /// Record a resolution and drain any packets parked behind it. The
    /// returned packets have their destination MAC patched in and are ready
    /// to transmit.
    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddr, now_s: u64) -> Vec<PacketBuf> {
        self.entries.insert(
            ip,
            ArpEntry {
                mac,
                deadline_s: now_s + self.ttl_s,
            },
        );

        let mut ready = self.pending.remove(&ip).unwrap_or_default();
        for pkt in ready.iter_mut() {
            patch_dst_mac(pkt, mac);
        }
        ready
    }

    /// Park a packet behind an unresolved destination.
    ///
    /// Returns `true` when this was the first packet — exactly one ARP
    /// request should go out. The queue is bounded; the oldest parked
    /// packet drops when it overflows.
    pub fn queue_pending(&mut self, ip: Ipv4Addr, pkt: PacketBuf) -> bool {
        let queue = self.pending.entry(ip).or_default();
        let first = queue.is_empty();
        if queue.len() >= ARP_PENDING_LIMIT {
            klog_debug!("arp: pending queue for {} full, dropping oldest", ip);
            queue.remove(0);
        }
        queue.push(pkt);
        first
    }

    /// Evict expired entries and orphaned pending queues. Driven by the
    /// periodic flush timer. Returns the number of cache entries removed.
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

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|q| q.len()).sum()
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Overwrite the destination MAC of a parked egress frame. The frame's head
/// sits at its Ethernet header.
fn patch_dst_mac(pkt: &mut PacketBuf, mac: MacAddr) {
    let data = pkt.payload_mut();
    if data.len() >= ETH_ADDR_LEN {
        data[..ETH_ADDR_LEN].copy_from_slice(&mac.0);
    }
}
