//! End-to-end stack scenarios over simulated wires.
//!
//! Two hosts and a two-legged gateway are stood up as separate `Inet`
//! instances on capture devices; a pump loop shuttles frames between the
//! mailboxes like a pair of cables. Covered: ping round-trip with TTL
//! accounting, a full TCP handshake host-to-host, the PMTU update path
//! from an ICMP Too Big, and conntrack serialization across a simulated
//! live handoff.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use keel_lib::clock;
use keel_lib::testing::TestResult;
use keel_lib::{assert_eq_test, assert_test, define_test_suite, fail, pass};

use crate::conntrack::Conntrack;
use crate::icmp4;
use crate::inet::{self, InetConfig};
use crate::ip4;
use crate::netdev::{CaptureDevice, DEVICE_REGISTRY};
use crate::packetbuf::{PacketBuf, transport_checksum};
use crate::pool::PACKET_POOL;
use crate::router::{self, Route};
use crate::tcp::{self, TCP_FLAG_ACK, TCP_FLAG_SYN, TcpState};
use crate::types::{DevIndex, Ipv4Addr, MacAddr, Port, Socket};
use crate::{ETHERTYPE_IPV4, IPPROTO_TCP, IPV4_HEADER_LEN};

const A_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 42]);
const B_IP: Ipv4Addr = Ipv4Addr([10, 0, 1, 50]);
const GW_A_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 1]);
const GW_B_IP: Ipv4Addr = Ipv4Addr([10, 0, 1, 1]);
const MASK: Ipv4Addr = Ipv4Addr([255, 255, 255, 0]);

const A_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 0xA0]);
const B_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 0xB0]);
const GW_A_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 0x1A]);
const GW_B_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 0x1B]);

const MB_A: usize = 3;
const MB_GW_A: usize = 4;
const MB_GW_B: usize = 5;
const MB_B: usize = 6;

struct Topology {
    dev_a: DevIndex,
    dev_gw_a: DevIndex,
    dev_gw_b: DevIndex,
    dev_b: DevIndex,
}

fn host_cfg(addr: Ipv4Addr, gateway: Ipv4Addr) -> InetConfig {
    let mut cfg = InetConfig::unconfigured(1500);
    cfg.addr = addr;
    cfg.netmask = MASK;
    cfg.gateway = gateway;
    cfg
}

fn register(mac: MacAddr, mailbox: usize) -> DevIndex {
    DEVICE_REGISTRY
        .register(alloc::boxed::Box::new(CaptureDevice::new(mac, 1500, mailbox)))
        .expect("device slot")
}

fn build_topology() -> Topology {
    PACKET_POOL.init();
    tcp::reset_all();
    CaptureDevice::clear_all();

    let dev_a = register(A_MAC, MB_A);
    let dev_gw_a = register(GW_A_MAC, MB_GW_A);
    let dev_gw_b = register(GW_B_MAC, MB_GW_B);
    let dev_b = register(B_MAC, MB_B);

    inet::create(dev_a, host_cfg(A_IP, GW_A_IP));
    inet::create(dev_gw_a, host_cfg(GW_A_IP, Ipv4Addr::UNSPECIFIED));
    inet::create(dev_gw_b, host_cfg(GW_B_IP, Ipv4Addr::UNSPECIFIED));
    inet::create(dev_b, host_cfg(B_IP, GW_B_IP));

    inet::with_inet(dev_gw_a, |inet| inet.forwarding = true);
    inet::with_inet(dev_gw_b, |inet| inet.forwarding = true);

    router::with_router(|r| {
        r.clear();
        r.add(Route::new(Ipv4Addr([10, 0, 0, 0]), MASK, GW_A_IP, dev_gw_a, 100));
        r.add(Route::new(Ipv4Addr([10, 0, 1, 0]), MASK, GW_B_IP, dev_gw_b, 100));
    });

    // Pre-resolve every neighbor so the scenarios exercise their own
    // subject matter rather than ARP (covered by its own suite).
    let now = clock::wall_s();
    inet::with_inet(dev_a, |inet| inet.arp.insert(GW_A_IP, GW_A_MAC, now));
    inet::with_inet(dev_gw_a, |inet| inet.arp.insert(A_IP, A_MAC, now));
    inet::with_inet(dev_gw_b, |inet| inet.arp.insert(B_IP, B_MAC, now));
    inet::with_inet(dev_b, |inet| inet.arp.insert(GW_B_IP, GW_B_MAC, now));

    Topology {
        dev_a,
        dev_gw_a,
        dev_gw_b,
        dev_b,
    }
}

fn teardown(topo: &Topology) {
    tcp::reset_all();
    router::with_router(|r| r.clear());
    for dev in [topo.dev_a, topo.dev_gw_a, topo.dev_gw_b, topo.dev_b] {
        inet::destroy(dev);
        DEVICE_REGISTRY.unregister(dev);
    }
    CaptureDevice::clear_all();
}

/// One hop of the cable: deliver everything a mailbox holds into the
/// device at the other end.
fn deliver_mailbox(mailbox: usize, into: DevIndex) -> usize {
    let frames = CaptureDevice::drain_mailbox(mailbox);
    let count = frames.len();
    for frame in frames {
        if let Some(pkt) = PacketBuf::from_raw_copy(&frame) {
            crate::ethernet::handle_frame(into, pkt);
        }
    }
    count
}

/// Shuttle frames across both wires until traffic quiesces.
fn pump(topo: &Topology) {
    for _ in 0..32 {
        let moved = deliver_mailbox(MB_A, topo.dev_gw_a)
            + deliver_mailbox(MB_GW_A, topo.dev_a)
            + deliver_mailbox(MB_GW_B, topo.dev_b)
            + deliver_mailbox(MB_B, topo.dev_gw_b);
        if moved == 0 {
            return;
        }
    }
}

// =============================================================================
// Scenario 1: ping round-trip through the gateway
// =============================================================================

static REPLY_SEEN: AtomicUsize = AtomicUsize::new(0);
static REPLY_META: AtomicU32 = AtomicU32::new(0);

fn echo_handler(from: Ipv4Addr, id: u16, seq: u16, _payload: &[u8]) {
    if from == B_IP {
        REPLY_SEEN.fetch_add(1, Ordering::Relaxed);
        REPLY_META.store(((id as u32) << 16) | seq as u32, Ordering::Relaxed);
    }
}

fn ttl_of_frame(frame: &[u8]) -> Option<u8> {
    if frame.len() < 14 + IPV4_HEADER_LEN {
        return None;
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_IPV4 {
        return None;
    }
    Some(frame[14 + 8])
}

pub fn test_ping_round_trip_through_gateway() -> TestResult {
    let topo = build_topology();
    REPLY_SEEN.store(0, Ordering::Relaxed);

    icmp4::on_echo_reply(0x4242, echo_handler);
    icmp4::send_echo(topo.dev_a, B_IP, 0x4242, 7, b"keelping");

    // Stage the pump so the in-flight TTLs are observable.
    assert_eq_test!(
        deliver_mailbox(MB_A, topo.dev_gw_a),
        1,
        "echo request left host A"
    );
    let toward_b = CaptureDevice::drain_mailbox(MB_GW_B);
    assert_eq_test!(toward_b.len(), 1, "gateway forwarded one frame");
    assert_eq_test!(
        ttl_of_frame(&toward_b[0]),
        Some(ip4::DEFAULT_TTL - 1),
        "exactly one hop spent on the way out"
    );
    for frame in toward_b {
        if let Some(pkt) = PacketBuf::from_raw_copy(&frame) {
            crate::ethernet::handle_frame(topo.dev_b, pkt);
        }
    }

    // B's reply takes the return path through the gateway.
    assert_eq_test!(deliver_mailbox(MB_B, topo.dev_gw_b), 1, "reply left host B");
    let toward_a = CaptureDevice::drain_mailbox(MB_GW_A);
    assert_eq_test!(toward_a.len(), 1, "gateway forwarded the reply");
    assert_eq_test!(
        ttl_of_frame(&toward_a[0]),
        Some(ip4::DEFAULT_TTL - 1),
        "one hop spent on the way back"
    );
    for frame in toward_a {
        if let Some(pkt) = PacketBuf::from_raw_copy(&frame) {
            crate::ethernet::handle_frame(topo.dev_a, pkt);
        }
    }

    assert_eq_test!(REPLY_SEEN.load(Ordering::Relaxed), 1, "reply delivered");
    let meta = REPLY_META.load(Ordering::Relaxed);
    assert_eq_test!(meta >> 16, 0x4242, "identifier preserved");
    assert_eq_test!(meta & 0xFFFF, 7, "sequence preserved");

    icmp4::clear_echo_handler(0x4242);
    teardown(&topo);
    pass!()
}

// =============================================================================
// Scenario 2: host-to-host TCP handshake
// =============================================================================

pub fn test_tcp_handshake_host_to_host() -> TestResult {
    let topo = build_topology();

    let server = tcp::listen(topo.dev_b, Socket::new(B_IP, Port(5000))).unwrap();
    let client = tcp::connect(topo.dev_a, Socket::new(B_IP, Port(5000))).unwrap();

    pump(&topo);

    assert_eq_test!(
        tcp::state_of(client),
        Some(TcpState::Established),
        "client established"
    );
    // The server side spawned a child connection for the flow.
    assert_eq_test!(tcp::active_connections(), 2, "both endpoint halves live");
    assert_eq_test!(tcp::state_of(server), Some(TcpState::Listen), "listener intact");

    // Data crosses the wire end to end.
    tcp::send(client, b"over the gateway").unwrap();
    pump(&topo);

    let server_side = (0..crate::tcp::MAX_CONNECTIONS)
        .map(tcp::ConnId)
        .find(|id| {
            tcp::state_of(*id) == Some(TcpState::Established)
                && tcp::tuple_of(*id).map(|t| t.local.ip) == Some(B_IP)
        });
    let server_side = match server_side {
        Some(id) => id,
        None => return fail!("no established server-side connection"),
    };
    let mut buf = [0u8; 64];
    let n = tcp::recv(server_side, &mut buf).unwrap();
    assert_eq_test!(&buf[..n], b"over the gateway", "payload arrived in order");

    teardown(&topo);
    pass!()
}

// =============================================================================
// Scenario 3: PMTU update from an ICMP Too Big
// =============================================================================

pub fn test_icmp_too_big_updates_pmtu_and_mss() -> TestResult {
    let topo = build_topology();
    inet::with_inet(topo.dev_a, |inet| inet.pmtu.set_enabled(true));

    let server = tcp::listen(topo.dev_b, Socket::new(B_IP, Port(443))).unwrap();
    let client = tcp::connect(topo.dev_a, Socket::new(B_IP, Port(443))).unwrap();
    pump(&topo);
    assert_eq_test!(tcp::state_of(client), Some(TcpState::Established), "connected");

    let mss_before = tcp::with_connection(client, |c| c.effective_mss()).unwrap();
    assert_eq_test!(mss_before, tcp::DEFAULT_MSS, "full MSS before the error");

    // The gateway reports: your segment toward B:443 needed fragmentation,
    // next-hop MTU 1400. The quote is the start of the offending packet.
    let local_port = tcp::with_connection(client, |c| c.tuple.local.port).unwrap();
    let mut quoted = alloc::vec![0u8; IPV4_HEADER_LEN + 8];
    ip4::write_header(&mut quoted, A_IP, B_IP, IPPROTO_TCP, 1460, 64);
    quoted[IPV4_HEADER_LEN..IPV4_HEADER_LEN + 2]
        .copy_from_slice(&local_port.to_network_bytes());
    quoted[IPV4_HEADER_LEN + 2..IPV4_HEADER_LEN + 4]
        .copy_from_slice(&443u16.to_be_bytes());

    inet::error_report(
        topo.dev_a,
        icmp4::IcmpError::new(
            icmp4::ICMP_DEST_UNREACHABLE,
            icmp4::ICMP_CODE_FRAGMENTATION_NEEDED,
            1400,
        ),
        &quoted,
    );

    let cached = inet::with_inet(topo.dev_a, |inet| {
        inet.pmtu.pmtu(Socket::new(B_IP, Port(443)))
    })
    .unwrap();
    assert_eq_test!(cached, 1400, "cache entry created at the reported MTU");

    let mss_after = tcp::with_connection(client, |c| c.effective_mss()).unwrap();
    assert_test!(
        mss_after <= 1340,
        "segments clamped to 1400 - 20 IP - 40 TCP"
    );

    let _ = server;
    teardown(&topo);
    pass!()
}

// =============================================================================
// Scenario 4: conntrack survives a live handoff
// =============================================================================

/// Craft a raw TCP-in-IPv4 Ethernet frame from A toward B.
fn tcp_frame(src_port: u16, flags: u8, seq: u32) -> alloc::vec::Vec<u8> {
    let mut segment = alloc::vec![0u8; 20];
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&80u16.to_be_bytes());
    segment[4..8].copy_from_slice(&seq.to_be_bytes());
    segment[12] = 5 << 4;
    segment[13] = flags;
    segment[14..16].copy_from_slice(&8192u16.to_be_bytes());
    let csum = transport_checksum(A_IP, B_IP, IPPROTO_TCP, &segment, 16);
    segment[16..18].copy_from_slice(&csum.to_be_bytes());

    let mut ip = alloc::vec![0u8; IPV4_HEADER_LEN];
    ip4::write_header(&mut ip, A_IP, B_IP, IPPROTO_TCP, segment.len(), 64);

    let mut frame = alloc::vec::Vec::new();
    frame.extend_from_slice(&GW_A_MAC.0);
    frame.extend_from_slice(&A_MAC.0);
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    frame.extend_from_slice(&ip);
    frame.extend_from_slice(&segment);
    frame
}

fn inject_into_gateway(topo: &Topology, frame: &[u8]) {
    if let Some(pkt) = PacketBuf::from_raw_copy(frame) {
        crate::ethernet::handle_frame(topo.dev_gw_a, pkt);
    }
}

pub fn test_conntrack_serialize_restore_across_handoff() -> TestResult {
    let topo = build_topology();
    router::with_router(|r| r.add_forward_filter(router::conntrack_filter));

    // Ten flows open through the gateway.
    for i in 0..10u16 {
        inject_into_gateway(&topo, &tcp_frame(42_000 + i, TCP_FLAG_SYN, 100));
    }
    assert_eq_test!(
        CaptureDevice::drain_mailbox(MB_GW_B).len(),
        10,
        "all SYNs forwarded"
    );

    // Mid-stream traffic passes while the flows are tracked.
    for i in 0..10u16 {
        inject_into_gateway(&topo, &tcp_frame(42_000 + i, TCP_FLAG_ACK, 101));
    }
    assert_eq_test!(
        CaptureDevice::drain_mailbox(MB_GW_B).len(),
        10,
        "tracked mid-stream segments forwarded"
    );

    // Serialize the gateway's state, then replace the instance with an
    // empty one — the handoff window.
    let mut snapshot = alloc::vec::Vec::new();
    let handle = inet::with_inet(topo.dev_gw_a, |inet| inet.conntrack.clone()).unwrap();
    handle.lock().serialize_to(&mut snapshot);
    let flows = handle.lock().number_of_entries();
    assert_eq_test!(flows, 10, "ten flows tracked before the handoff");
    *handle.lock() = Conntrack::new();

    // With the state gone, mid-stream segments are invalid and drop.
    for i in 0..10u16 {
        inject_into_gateway(&topo, &tcp_frame(42_000 + i, TCP_FLAG_ACK, 102));
    }
    let dropped_window = CaptureDevice::drain_mailbox(MB_GW_B).len();
    assert_eq_test!(dropped_window, 0, "all untracked segments dropped");
    assert_test!(10 - dropped_window >= 6, "at least six drops in the window");

    // Restore: flows resume without any handshake renegotiation.
    handle.lock().deserialize_from(&snapshot).unwrap();
    assert_eq_test!(
        handle.lock().number_of_entries(),
        10,
        "state restored from the snapshot"
    );
    for i in 0..10u16 {
        inject_into_gateway(&topo, &tcp_frame(42_000 + i, TCP_FLAG_ACK, 103));
    }
    assert_eq_test!(
        CaptureDevice::drain_mailbox(MB_GW_B).len(),
        10,
        "restored flows forward again"
    );

    teardown(&topo);
    pass!()
}

define_test_suite!(
    inet_e2e,
    [
        test_ping_round_trip_through_gateway,
        test_tcp_handshake_host_to_host,
        test_icmp_too_big_updates_pmtu_and_mss,
        test_conntrack_serialize_restore_across_handoff,
    ]
);
