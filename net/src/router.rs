//! IP forwarding: route table, longest-prefix lookup, filter chain.
//!
//! Forwarding is conservative: no route means a silent drop. TTL handling
//! follows the ingress side — locally generated traffic is never
//! decremented, and a zero TTL earns an ICMP Time Exceeded (except toward
//! multicast destinations) when the toggle allows it.

extern crate alloc;

use alloc::vec::Vec;

use keel_lib::{IrqMutex, clock, klog_debug};

use super::conntrack::Quadruple;
use super::inet::with_inet;
use super::ip4::{self, Direction, DropReason, Ipv4Header};
use super::packetbuf::PacketBuf;
use super::types::{DevIndex, IpProtocol, Ipv4Addr, Port, Socket};

// =============================================================================
// Routes
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub net: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub nexthop: Ipv4Addr,
    pub iface: DevIndex,
    pub cost: u32,
}

impl Route {
    pub const fn new(
        net: Ipv4Addr,
        netmask: Ipv4Addr,
        nexthop: Ipv4Addr,
        iface: DevIndex,
        cost: u32,
    ) -> Self {
        Self {
            net,
            netmask,
            nexthop,
            iface,
            cost,
        }
    }

    #[inline]
    pub fn matches(&self, dst: Ipv4Addr) -> bool {
        Ipv4Addr::in_subnet(dst, self.net, self.netmask)
    }

    /// Next hop toward `dst`: the destination itself when it sits on the
    /// egress interface's subnet, else the configured gateway.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        let on_link = with_inet(self.iface, |inet| {
            Ipv4Addr::in_subnet(dst, inet.cfg.addr, inet.cfg.netmask)
        })
        .unwrap_or(false);
        if on_link { dst } else { self.nexthop }
    }

    fn mask_bits(&self) -> u32 {
        self.netmask.to_u32_be().count_ones()
    }
}

// =============================================================================
// Filter chain
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

/// One filter in the forward chain.
pub type FilterFn = fn(DevIndex, &Ipv4Header, &[u8]) -> Verdict;

/// A stock filter enforcing conntrack validity: a TCP segment that belongs
/// to no tracked flow and does not open one (no SYN) is invalid and drops.
/// This is what makes mid-stream packets die when conntrack state is lost
/// and resume when it is restored.
pub fn conntrack_filter(dev: DevIndex, header: &Ipv4Header, l4: &[u8]) -> Verdict {
    if header.protocol != super::IPPROTO_TCP || l4.len() < 14 {
        return Verdict::Accept;
    }
    let syn = l4[13] & super::tcp::TCP_FLAG_SYN != 0;
    if syn {
        return Verdict::Accept;
    }
    let quad = Quadruple::new(
        Socket::new(header.src, Port(u16::from_be_bytes([l4[0], l4[1]]))),
        Socket::new(header.dst, Port(u16::from_be_bytes([l4[2], l4[3]]))),
    );
    let tracked = with_inet(dev, |inet| inet.conntrack.clone())
        .map(|ct| ct.lock().get(quad, IpProtocol::Tcp).is_some())
        .unwrap_or(false);
    if tracked {
        Verdict::Accept
    } else {
        klog_debug!("router: invalid mid-stream segment {} -> {}", header.src, header.dst);
        Verdict::Drop
    }
}

// =============================================================================
// Router
// =============================================================================

pub struct Router {
    routes: Vec<Route>,
    forward_chain: Vec<FilterFn>,
    /// Emit ICMP Time Exceeded for zero-TTL packets.
    pub send_time_exceeded: bool,
}

impl Router {
    pub const fn new() -> Self {
        Self {
            routes: Vec::new(),
            forward_chain: Vec::new(),
            send_time_exceeded: true,
        }
    }

    pub fn add(&mut self, route: Route) {
        self.routes.push(route);
    }

    pub fn clear(&mut self) {
        self.routes.clear();
        self.forward_chain.clear();
        self.send_time_exceeded = true;
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn add_forward_filter(&mut self, filter: FilterFn) {
        self.forward_chain.push(filter);
    }

    /// First route matching `dst`, in insertion order.
    pub fn get_first_route(&self, dst: Ipv4Addr) -> Option<Route> {
        self.routes.iter().find(|r| r.matches(dst)).copied()
    }

    /// The matching route with the largest netmask; ties break by cost.
    pub fn get_most_specific_route(&self, dst: Ipv4Addr) -> Option<Route> {
        let mut best: Option<Route> = None;
        for route in self.routes.iter().filter(|r| r.matches(dst)) {
            best = match best {
                None => Some(*route),
                Some(current) => {
                    let better = route.mask_bits() > current.mask_bits()
                        || (route.mask_bits() == current.mask_bits()
                            && route.cost < current.cost);
                    if better { Some(*route) } else { Some(current) }
                }
            };
        }
        best
    }

    /// The matching route with the lowest cost.
    pub fn get_cheapest_route(&self, dst: Ipv4Addr) -> Option<Route> {
        self.routes
            .iter()
            .filter(|r| r.matches(dst))
            .min_by_key(|r| r.cost)
            .copied()
    }

    /// Run the forward chain; the first `Drop` verdict short-circuits.
    pub fn run_filters(&self, dev: DevIndex, header: &Ipv4Header, l4: &[u8]) -> Verdict {
        for filter in &self.forward_chain {
            if filter(dev, header, l4) == Verdict::Drop {
                return Verdict::Drop;
            }
        }
        Verdict::Accept
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

static ROUTER: IrqMutex<Router> = IrqMutex::new(Router::new());

pub fn with_router<R>(f: impl FnOnce(&mut Router) -> R) -> R {
    f(&mut ROUTER.lock())
}

/// Did `addr` originate on the ingress interface itself? Locally generated
/// traffic keeps its TTL; only transit traffic spends a hop.
fn is_local_source(dev_in: DevIndex, addr: Ipv4Addr) -> bool {
    with_inet(dev_in, |inet| inet.cfg.addr == addr).unwrap_or(false)
}

// =============================================================================
// Forward pipeline
// =============================================================================

/// Forward a packet whose destination is not local. The packet's head
/// still sits at its IP header.
pub fn forward(dev_in: DevIndex, mut pkt: PacketBuf, header: Ipv4Header) {
    // 1. A dead packet earns a Time Exceeded note (never for multicast).
    if header.ttl == 0 {
        ip4::drop_packet(dev_in, Direction::Ingress, DropReason::Ttl0);
        let notify = ROUTER.lock().send_time_exceeded;
        if notify && !header.dst.is_multicast() {
            super::icmp4::send_time_exceeded(dev_in, header.src, pkt.payload());
        }
        return;
    }

    // 2. Transit traffic spends a hop; locally sourced traffic does not.
    if !is_local_source(dev_in, header.src) {
        ip4::decrement_ttl(&mut pkt);
    }

    // 3. The forward filter chain gets the final say.
    let l4 = &pkt.payload()[header.header_len..];
    let verdict = ROUTER.lock().run_filters(dev_in, &header, l4);
    if verdict == Verdict::Drop {
        return;
    }

    // Track the flow on the way through so replies match.
    track_forward(dev_in, &header, l4);

    // 4. No route, no delivery — forwarding is conservative.
    let route = match ROUTER.lock().get_most_specific_route(header.dst) {
        Some(route) => route,
        None => {
            klog_debug!("router: no route to {}", header.dst);
            return;
        }
    };

    // 5./6. Resolve the per-destination next hop and ship via the egress
    // interface's IP layer.
    let next_hop = route.next_hop(header.dst);
    ip4::ship_forward(route.iface, pkt, next_hop);
}

fn track_forward(dev_in: DevIndex, header: &Ipv4Header, l4: &[u8]) {
    let Some(proto) = IpProtocol::from_u8(header.protocol) else {
        return;
    };
    if !matches!(proto, IpProtocol::Tcp | IpProtocol::Udp) || l4.len() < 4 {
        return;
    }
    let quad = Quadruple::new(
        Socket::new(header.src, Port(u16::from_be_bytes([l4[0], l4[1]]))),
        Socket::new(header.dst, Port(u16::from_be_bytes([l4[2], l4[3]]))),
    );
    let now = clock::wall_s();
    if let Some(ct) = with_inet(dev_in, |inet| inet.conntrack.clone()) {
        let mut ct = ct.lock();
        ct.in_(quad, proto, now);
        ct.confirm(quad, proto, now);
    }
}
