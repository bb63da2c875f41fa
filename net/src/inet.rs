//! Per-NIC stack assembly.
//!
//! One [`Inet`] per network device wires the layers together: device ↔ link
//! ↔ ARP/NDP ↔ IPv4/IPv6 ↔ {ICMP, UDP, TCP}, plus the caches that belong
//! to the interface (ARP, NDP, PMTU) and the conntrack instance shared by
//! everything flowing through it. Mutation happens only on the CPU owning
//! the interface; the registry lock covers the SMP edges.
//!
//! Transport errors reported by ICMP funnel through [`error_report`], which
//! routes them to TCP or UDP based on the protocol of the quoted packet.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use keel_lib::{IrqMutex, clock, klog_debug, klog_info};

use super::arp::{self, ArpCache};
use super::conntrack::Conntrack;
use super::icmp4::IcmpError;
use super::icmp6::NeighborCache6;
use super::ip4::{DropReason, Direction};
use super::netdev::DEVICE_REGISTRY;
use super::packetbuf::PacketBuf;
use super::pmtu::PmtuCache;
use super::timer::{NET_TIMERS, TimerKind};
use super::types::{DevIndex, Ipv4Addr, Ipv6Addr, MacAddr, Port, Socket};
use super::{ARP_OPER_REPLY, ARP_OPER_REQUEST, IPPROTO_TCP, IPPROTO_UDP};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Clone, Copy, Debug)]
pub struct InetConfig {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub addr6: Ipv6Addr,
    pub mtu: u16,
}

impl InetConfig {
    pub const fn unconfigured(mtu: u16) -> Self {
        Self {
            addr: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            addr6: Ipv6Addr::UNSPECIFIED,
            mtu,
        }
    }
}

/// Per-reason ingress/egress drop counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct DropCounters {
    pub wrong_version: u64,
    pub wrong_checksum: u64,
    pub bad_source: u64,
    pub bad_destination: u64,
    pub unknown_proto: u64,
    pub ttl0: u64,
    pub bad_length: u64,
}

impl DropCounters {
    pub const fn new() -> Self {
        Self {
            wrong_version: 0,
            wrong_checksum: 0,
            bad_source: 0,
            bad_destination: 0,
            unknown_proto: 0,
            ttl0: 0,
            bad_length: 0,
        }
    }

    pub fn bump(&mut self, reason: DropReason) {
        match reason {
            DropReason::WrongVersion => self.wrong_version += 1,
            DropReason::WrongChecksum => self.wrong_checksum += 1,
            DropReason::BadSource => self.bad_source += 1,
            DropReason::BadDestination => self.bad_destination += 1,
            DropReason::UnknownProto => self.unknown_proto += 1,
            DropReason::Ttl0 => self.ttl0 += 1,
            DropReason::BadLength => self.bad_length += 1,
        }
    }

    pub fn count(&self, reason: DropReason) -> u64 {
        match reason {
            DropReason::WrongVersion => self.wrong_version,
            DropReason::WrongChecksum => self.wrong_checksum,
            DropReason::BadSource => self.bad_source,
            DropReason::BadDestination => self.bad_destination,
            DropReason::UnknownProto => self.unknown_proto,
            DropReason::Ttl0 => self.ttl0,
            DropReason::BadLength => self.bad_length,
        }
    }

    pub fn total(&self) -> u64 {
        self.wrong_version
            + self.wrong_checksum
            + self.bad_source
            + self.bad_destination
            + self.unknown_proto
            + self.ttl0
            + self.bad_length
    }
}

/// Delegate invoked for every packet drop; the default logs at debug level.
pub type DropHandlerFn = fn(DevIndex, Direction, DropReason);

fn default_drop_handler(dev: DevIndex, direction: Direction, reason: DropReason) {
    klog_debug!("{}: drop {:?} {:?}", dev, direction, reason);
}

/// Delegate resolving a hostname to an address (wired to the DNS client).
pub type ResolverFn = fn(&str) -> Option<Ipv4Addr>;

// =============================================================================
// Inet
// =============================================================================

pub struct Inet {
    pub iface: DevIndex,
    pub cfg: InetConfig,
    pub mac: MacAddr,
    pub arp: ArpCache,
    pub neighbors6: NeighborCache6,
    pub pmtu: PmtuCache,
    pub counters: DropCounters,
    pub forwarding: bool,
    pub drop_handler: DropHandlerFn,
    pub resolver: Option<ResolverFn>,
    pub conntrack: Arc<IrqMutex<Conntrack>>,
}

impl Inet {
    fn new(iface: DevIndex, mac: MacAddr, cfg: InetConfig) -> Self {
        Self {
            iface,
            cfg,
            mac,
            arp: ArpCache::new(),
            neighbors6: NeighborCache6::new(),
            pmtu: PmtuCache::new(),
            counters: DropCounters::new(),
            forwarding: false,
            drop_handler: default_drop_handler,
            resolver: None,
            conntrack: Arc::new(IrqMutex::new(Conntrack::new())),
        }
    }

    /// True when `addr` is one of this interface's receive addresses:
    /// own unicast, limited broadcast, or the subnet's directed broadcast.
    pub fn accepts(&self, addr: Ipv4Addr) -> bool {
        if addr == self.cfg.addr || addr.is_broadcast() {
            return true;
        }
        if !self.cfg.addr.is_unspecified()
            && addr == self.cfg.addr.subnet_broadcast(self.cfg.netmask)
        {
            return true;
        }
        false
    }

    /// Next hop for `dst`: the destination itself when on-link, else the
    /// configured gateway.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if Ipv4Addr::in_subnet(dst, self.cfg.addr, self.cfg.netmask) || dst.is_broadcast() {
            dst
        } else {
            self.cfg.gateway
        }
    }
}

static INETS: IrqMutex<Vec<Inet>> = IrqMutex::new(Vec::new());

/// Stand up the stack on a registered device. The periodic interface
/// timers (ARP flush, NDP flush, PMTU ageing, conntrack flush) are
/// scheduled here.
pub fn create(iface: DevIndex, cfg: InetConfig) {
    let mac = DEVICE_REGISTRY.mac(iface).unwrap_or(MacAddr::ZERO);
    let mut inets = INETS.lock();
    inets.push(Inet::new(iface, mac, cfg));
    drop(inets);

    let key = iface.0 as u32;
    NET_TIMERS.schedule_periodic(TimerKind::ArpFlush, key, arp::ARP_FLUSH_INTERVAL_S * 1000);
    NET_TIMERS.schedule_periodic(TimerKind::NeighborFlush6, key, arp::ARP_FLUSH_INTERVAL_S * 1000);
    NET_TIMERS.schedule_periodic(TimerKind::PmtuAge, key, 60_000);
    NET_TIMERS.schedule_periodic(
        TimerKind::ConntrackFlush,
        key,
        super::conntrack::CT_FLUSH_INTERVAL_S * 1000,
    );

    klog_info!("{}: inet up, addr {} mtu {}", iface, cfg.addr, cfg.mtu);
}

/// Tear down an interface's stack instance (tests).
pub fn destroy(iface: DevIndex) {
    let mut inets = INETS.lock();
    inets.retain(|inet| inet.iface != iface);
}

/// Run `f` with the interface's stack instance.
pub fn with_inet<R>(iface: DevIndex, f: impl FnOnce(&mut Inet) -> R) -> Option<R> {
    let mut inets = INETS.lock();
    inets.iter_mut().find(|i| i.iface == iface).map(f)
}

pub fn mac_of(iface: DevIndex) -> Option<MacAddr> {
    with_inet(iface, |inet| inet.mac)
}

pub fn addr_of(iface: DevIndex) -> Option<Ipv4Addr> {
    with_inet(iface, |inet| inet.cfg.addr)
}

pub fn mtu_of(iface: DevIndex) -> Option<u16> {
    with_inet(iface, |inet| inet.cfg.mtu)
}

/// First configured interface (convenience for single-NIC images).
pub fn default_iface() -> Option<DevIndex> {
    INETS.lock().first().map(|inet| inet.iface)
}

// =============================================================================
// Ingress pump
// =============================================================================

/// Drain up to `budget` frames from the device into the stack. Called from
/// the device's ingress fiber after its ISR posts a wakeup.
pub fn poll_device(iface: DevIndex, budget: usize) -> usize {
    let frames = DEVICE_REGISTRY.poll_rx(iface, budget);
    let count = frames.len();
    for pkt in frames {
        super::ethernet::handle_frame(iface, pkt);
    }
    count
}

// =============================================================================
// ARP orchestration
// =============================================================================

/// Handle an incoming ARP payload for `iface`.
pub(crate) fn arp_input(iface: DevIndex, pkt: PacketBuf) {
    let Some(frame) = arp::parse(pkt.payload()) else {
        return;
    };
    let now = clock::wall_s();

    // Decide under the lock, transmit after.
    let (flushed, reply) = match with_inet(iface, |inet| {
        // RFC 826: opportunistically refresh the cache from any ARP.
        let flushed = inet.arp.insert(frame.sender_ip, frame.sender_mac, now);

        let reply = match frame.oper {
            ARP_OPER_REQUEST => {
                let for_us = frame.target_ip == inet.cfg.addr && !inet.cfg.addr.is_unspecified();
                if for_us || inet.arp.proxy_allows(frame.target_ip) {
                    arp::build_reply(inet.mac, frame.target_ip, frame.sender_mac, frame.sender_ip)
                } else {
                    None
                }
            }
            ARP_OPER_REPLY => {
                klog_debug!("{}: arp reply {} is {}", iface, frame.sender_ip, frame.sender_mac);
                None
            }
            _ => None,
        };
        (flushed, reply)
    }) {
        Some(result) => result,
        None => return,
    };

    for ready in flushed {
        let _ = DEVICE_REGISTRY.transmit(iface, ready);
    }
    if let Some(reply) = reply {
        let _ = DEVICE_REGISTRY.transmit(iface, reply);
    }
}

/// Send an IP packet (Ethernet header not yet present) toward `next_hop`,
/// resolving the destination MAC through the ARP cache. A miss parks the
/// packet and emits one request.
pub(crate) fn resolve_and_ship(iface: DevIndex, mut pkt: PacketBuf, next_hop: Ipv4Addr, ethertype: u16) {
    let now = clock::wall_s();

    enum Action {
        Transmit(PacketBuf),
        Request(PacketBuf),
        Dropped,
    }

    let action = match with_inet(iface, |inet| {
        if next_hop.is_broadcast() {
            if super::ethernet::push_frame_header(&mut pkt, MacAddr::BROADCAST, inet.mac, ethertype)
                .is_err()
            {
                return Action::Dropped;
            }
            return Action::Transmit(pkt);
        }

        match inet.arp.lookup(next_hop, now) {
            Some(mac) => {
                if super::ethernet::push_frame_header(&mut pkt, mac, inet.mac, ethertype).is_err() {
                    return Action::Dropped;
                }
                Action::Transmit(pkt)
            }
            None => {
                // Park behind the resolution with a placeholder MAC; the
                // reply patches it in.
                if super::ethernet::push_frame_header(&mut pkt, MacAddr::ZERO, inet.mac, ethertype)
                    .is_err()
                {
                    return Action::Dropped;
                }
                let first = inet.arp.queue_pending(next_hop, pkt);
                if first {
                    match arp::build_request(inet.mac, inet.cfg.addr, next_hop) {
                        Some(request) => Action::Request(request),
                        None => Action::Dropped,
                    }
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
            let _ = DEVICE_REGISTRY.transmit(iface, frame);
        }
        Action::Request(request) => {
            let _ = DEVICE_REGISTRY.transmit(iface, request);
        }
        Action::Dropped => {}
    }
}

// =============================================================================
// Transport error routing
// =============================================================================

/// Route an ICMP-reported error to the transport that caused it.
///
/// `original` is the quoted IP header + leading payload bytes from the ICMP
/// body: enough to recover the protocol and the ports.
pub fn error_report(iface: DevIndex, err: IcmpError, original: &[u8]) {
    if original.len() < super::IPV4_HEADER_LEN + 4 {
        return;
    }
    let ihl = ((original[0] & 0x0F) as usize) * 4;
    if original.len() < ihl + 4 {
        return;
    }
    let proto = original[9];
    let src = Ipv4Addr([original[12], original[13], original[14], original[15]]);
    let dst = Ipv4Addr([original[16], original[17], original[18], original[19]]);
    let src_port = Port(u16::from_be_bytes([original[ihl], original[ihl + 1]]));
    let dst_port = Port(u16::from_be_bytes([original[ihl + 2], original[ihl + 3]]));
    let total_len = u16::from_be_bytes([original[2], original[3]]);

    // Path MTU first: a Too Big note shrinks the cache before the
    // transport reacts.
    if let Some(mtu) = err.next_hop_mtu() {
        let dest = Socket::new(dst, dst_port);
        let now = clock::wall_s();
        let cached = with_inet(iface, |inet| {
            inet.pmtu.update_path(dest, mtu, false, total_len, now)
        })
        .unwrap_or(0);
        if cached != 0 {
            super::tcp::on_path_mtu(dest, cached);
        }
    }

    match proto {
        IPPROTO_TCP => super::tcp::error_report(
            Socket::new(src, src_port),
            Socket::new(dst, dst_port),
            err,
        ),
        IPPROTO_UDP => super::udp::error_report(
            iface,
            Socket::new(src, src_port),
            Socket::new(dst, dst_port),
            err,
        ),
        _ => {}
    }
}

// =============================================================================
// Timer dispatch
// =============================================================================

/// Advance the network timer wheel to `now_ms` and run every expired
/// timer's handler. Called from the timer tick path and the idle loop.
pub fn net_timer_process(now_ms: u64) {
    let fired = NET_TIMERS.advance_to(now_ms);
    if fired.is_empty() {
        return;
    }
    let now_s = clock::wall_s();

    for expired in fired {
        let iface = DevIndex(expired.key as usize);
        match expired.kind {
            TimerKind::ArpFlush => {
                with_inet(iface, |inet| inet.arp.flush_expired(now_s));
            }
            TimerKind::NeighborFlush6 => {
                with_inet(iface, |inet| inet.neighbors6.flush_expired(now_s));
            }
            TimerKind::PmtuAge => {
                let expired_paths =
                    with_inet(iface, |inet| inet.pmtu.age(now_s)).unwrap_or_default();
                for dest in expired_paths {
                    super::tcp::on_path_mtu_expired(dest);
                }
            }
            TimerKind::ConntrackFlush => {
                let ct = with_inet(iface, |inet| inet.conntrack.clone());
                if let Some(ct) = ct {
                    ct.lock().remove_expired(now_s);
                }
            }
            TimerKind::TcpRetransmit => {
                super::tcp::on_retransmit_timer(expired.key, now_ms);
            }
            TimerKind::TcpTimeWait => {
                super::tcp::on_time_wait_timer(expired.key, now_ms);
            }
        }
    }
}
