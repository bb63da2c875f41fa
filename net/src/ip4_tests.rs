//! IPv4 ingress validation tests: every drop is typed, counted, and
//! reported to the drop delegate exactly once; survivors reach their
//! transport.

use core::sync::atomic::{AtomicU64, Ordering};

use keel_lib::testing::TestResult;
use keel_lib::{assert_eq_test, assert_test, define_test_suite, pass};

use crate::inet::{self, InetConfig};
use crate::ip4::{self, Direction, DropReason};
use crate::netdev::{CaptureDevice, DEVICE_REGISTRY};
use crate::packetbuf::PacketBuf;
use crate::pool::PACKET_POOL;
use crate::types::{DevIndex, Ipv4Addr, MacAddr};
use crate::{IPPROTO_UDP, IPV4_HEADER_LEN};

const HOST_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 42]);
const PEER_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 50]);
const NETMASK: Ipv4Addr = Ipv4Addr([255, 255, 255, 0]);

static DELEGATE_CALLS: AtomicU64 = AtomicU64::new(0);

fn counting_drop_handler(_dev: DevIndex, _dir: Direction, _reason: DropReason) {
    DELEGATE_CALLS.fetch_add(1, Ordering::Relaxed);
}

fn make_host(mailbox: usize) -> DevIndex {
    PACKET_POOL.init();
    let mac = MacAddr([0x02, 0, 0, 0, 0, mailbox as u8]);
    let dev = DEVICE_REGISTRY
        .register(alloc::boxed::Box::new(CaptureDevice::new(mac, 1500, mailbox)))
        .expect("device slot");
    let mut cfg = InetConfig::unconfigured(1500);
    cfg.addr = HOST_IP;
    cfg.netmask = NETMASK;
    cfg.gateway = Ipv4Addr([10, 0, 0, 1]);
    inet::create(dev, cfg);
    inet::with_inet(dev, |inet| inet.drop_handler = counting_drop_handler);
    dev
}

fn teardown(dev: DevIndex) {
    inet::destroy(dev);
    DEVICE_REGISTRY.unregister(dev);
    CaptureDevice::clear_all();
}

/// A minimal UDP-in-IPv4 packet with a correct header checksum.
fn build_packet(src: Ipv4Addr, dst: Ipv4Addr, ttl: u8) -> alloc::vec::Vec<u8> {
    let udp = [
        0x10, 0x00, // src port 4096
        0x00, 0x35, // dst port 53
        0x00, 0x09, // length 9
        0x00, 0x00, // checksum 0 = none
        0x7A, // one payload byte
    ];
    let mut out = alloc::vec![0u8; IPV4_HEADER_LEN];
    ip4::write_header(&mut out, src, dst, IPPROTO_UDP, udp.len(), ttl);
    out.extend_from_slice(&udp);
    out
}

fn inject(dev: DevIndex, bytes: &[u8]) {
    let pkt = PacketBuf::from_raw_copy(bytes).expect("pool slot");
    ip4::handle_rx(dev, pkt);
}

fn drops(dev: DevIndex, reason: DropReason) -> u64 {
    inet::with_inet(dev, |inet| inet.counters.count(reason)).unwrap_or(0)
}

pub fn test_valid_packet_reaches_transport() -> TestResult {
    let dev = make_host(0);
    let before = inet::with_inet(dev, |inet| inet.counters.total()).unwrap();

    inject(dev, &build_packet(PEER_IP, HOST_IP, 64));

    let after = inet::with_inet(dev, |inet| inet.counters.total()).unwrap();
    assert_eq_test!(after, before, "no drop counted for a valid packet");
    teardown(dev);
    pass!()
}

pub fn test_wrong_version_drops_once() -> TestResult {
    let dev = make_host(0);
    DELEGATE_CALLS.store(0, Ordering::Relaxed);

    let mut bytes = build_packet(PEER_IP, HOST_IP, 64);
    bytes[0] = (6 << 4) | 5; // version 6 in an IPv4 frame
    inject(dev, &bytes);

    assert_eq_test!(drops(dev, DropReason::WrongVersion), 1, "counted");
    assert_eq_test!(
        DELEGATE_CALLS.load(Ordering::Relaxed),
        1,
        "delegate called exactly once"
    );
    teardown(dev);
    pass!()
}

pub fn test_checksum_corruption_detected() -> TestResult {
    let dev = make_host(0);
    let mut bytes = build_packet(PEER_IP, HOST_IP, 64);
    bytes[8] = bytes[8].wrapping_add(1); // TTL changed without checksum fix
    inject(dev, &bytes);
    assert_eq_test!(drops(dev, DropReason::WrongChecksum), 1, "counted");
    teardown(dev);
    pass!()
}

pub fn test_zero_source_allowed_only_to_limited_broadcast() -> TestResult {
    let dev = make_host(0);
    DELEGATE_CALLS.store(0, Ordering::Relaxed);

    // DHCP-style: 0.0.0.0 -> 255.255.255.255 passes.
    inject(dev, &build_packet(Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST, 64));
    assert_eq_test!(drops(dev, DropReason::BadSource), 0, "broadcast dest tolerated");

    // 0.0.0.0 -> unicast is a martian.
    inject(dev, &build_packet(Ipv4Addr::UNSPECIFIED, HOST_IP, 64));
    assert_eq_test!(drops(dev, DropReason::BadSource), 1, "unicast dest dropped");
    teardown(dev);
    pass!()
}

pub fn test_martian_sources_dropped() -> TestResult {
    let dev = make_host(0);

    inject(dev, &build_packet(Ipv4Addr::BROADCAST, HOST_IP, 64));
    assert_eq_test!(drops(dev, DropReason::BadSource), 1, "broadcast source");

    inject(dev, &build_packet(Ipv4Addr([224, 0, 0, 5]), HOST_IP, 64));
    assert_eq_test!(drops(dev, DropReason::BadSource), 2, "multicast source");

    // Our own subnet broadcast as a source.
    inject(dev, &build_packet(Ipv4Addr([10, 0, 0, 255]), HOST_IP, 64));
    assert_eq_test!(drops(dev, DropReason::BadSource), 3, "own broadcast source");
    teardown(dev);
    pass!()
}

pub fn test_foreign_destination_without_forwarding() -> TestResult {
    let dev = make_host(0);
    inject(dev, &build_packet(PEER_IP, Ipv4Addr([192, 168, 9, 9]), 64));
    assert_eq_test!(
        drops(dev, DropReason::BadDestination),
        1,
        "not ours, not forwarding"
    );
    teardown(dev);
    pass!()
}

pub fn test_unknown_protocol() -> TestResult {
    let dev = make_host(0);
    let mut bytes = build_packet(PEER_IP, HOST_IP, 64);
    bytes[9] = 250; // unassigned protocol
    // Fix the checksum for the altered protocol byte.
    bytes[10] = 0;
    bytes[11] = 0;
    let csum = crate::ones_complement_checksum(&bytes[..IPV4_HEADER_LEN]);
    bytes[10..12].copy_from_slice(&csum.to_be_bytes());

    inject(dev, &bytes);
    assert_eq_test!(drops(dev, DropReason::UnknownProto), 1, "counted");
    teardown(dev);
    pass!()
}

pub fn test_zero_ttl_into_forwarding() -> TestResult {
    let dev = make_host(0);
    inet::with_inet(dev, |inet| inet.forwarding = true);

    inject(dev, &build_packet(PEER_IP, Ipv4Addr([10, 9, 9, 9]), 0));
    assert_eq_test!(drops(dev, DropReason::Ttl0), 1, "dead packet counted");
    teardown(dev);
    pass!()
}

pub fn test_truncated_header() -> TestResult {
    let dev = make_host(0);
    let bytes = build_packet(PEER_IP, HOST_IP, 64);
    inject(dev, &bytes[..12]);
    assert_eq_test!(drops(dev, DropReason::BadLength), 1, "short header counted");
    teardown(dev);
    pass!()
}

pub fn test_ttl_decrement_keeps_checksum_valid() -> TestResult {
    PACKET_POOL.init();
    let bytes = build_packet(PEER_IP, HOST_IP, 64);
    let mut pkt = PacketBuf::from_raw_copy(&bytes).unwrap();

    ip4::decrement_ttl(&mut pkt);
    let header = &pkt.payload()[..IPV4_HEADER_LEN];
    assert_eq_test!(header[8], 63, "TTL dropped by one");
    assert_test!(
        ip4::verify_checksum(header),
        "incremental checksum update holds"
    );

    // Repeat down to 1 and recheck.
    for _ in 0..62 {
        ip4::decrement_ttl(&mut pkt);
    }
    let header = &pkt.payload()[..IPV4_HEADER_LEN];
    assert_eq_test!(header[8], 1, "TTL at 1");
    assert_test!(ip4::verify_checksum(header), "still valid after many hops");
    pass!()
}

define_test_suite!(
    ip4,
    [
        test_valid_packet_reaches_transport,
        test_wrong_version_drops_once,
        test_checksum_corruption_detected,
        test_zero_source_allowed_only_to_limited_broadcast,
        test_martian_sources_dropped,
        test_foreign_destination_without_forwarding,
        test_unknown_protocol,
        test_zero_ttl_into_forwarding,
        test_truncated_header,
        test_ttl_decrement_keeps_checksum_valid,
    ]
);
