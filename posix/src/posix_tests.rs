//! POSIX layer regression tests: descriptor numbering, file I/O through
//! the VFS, the RNG device, and the socket call surface.

extern crate alloc;

use alloc::boxed::Box;

use keel_lib::testing::TestResult;
use keel_lib::{assert_eq_test, assert_test, define_test_suite, pass};

use keel_abi::net::{AF_INET, SOCK_DGRAM, SOCK_STREAM, SockAddrIn};
use keel_fs::memfs::Memfs;
use keel_fs::{Dirent, FileSystem};
use keel_net::inet::{self, InetConfig};
use keel_net::netdev::{CaptureDevice, DEVICE_REGISTRY};
use keel_net::pool::PACKET_POOL;
use keel_net::types::{DevIndex, Ipv4Addr, MacAddr, Port, Socket};

use crate::errno::*;
use crate::fd_map;
use crate::sockcalls;
use crate::unistd::{self, SEEK_CUR, SEEK_END, SEEK_SET};

const HOST_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 42]);
const MAILBOX: usize = 7;

fn make_host() -> DevIndex {
    PACKET_POOL.init();
    fd_map::reset_for_tests();
    let dev = DEVICE_REGISTRY
        .register(Box::new(CaptureDevice::new(
            MacAddr([2, 0, 0, 0, 3, 0x42]),
            1500,
            MAILBOX,
        )))
        .expect("device slot");
    let mut cfg = InetConfig::unconfigured(1500);
    cfg.addr = HOST_IP;
    cfg.netmask = Ipv4Addr([255, 255, 255, 0]);
    inet::create(dev, cfg);
    dev
}

fn teardown(dev: DevIndex) {
    fd_map::reset_for_tests();
    keel_net::tcp::reset_all();
    keel_net::udp::reset_all();
    inet::destroy(dev);
    DEVICE_REGISTRY.unregister(dev);
    CaptureDevice::clear_all();
}

pub fn test_fd_numbering_starts_above_stdio() -> TestResult {
    fd_map::reset_for_tests();
    let a = unistd::open("/dev/urandom");
    let b = unistd::open("/dev/random");
    assert_eq_test!(a, 3, "first descriptor is 3");
    assert_eq_test!(b, 4, "monotone assignment");

    assert_eq_test!(unistd::close(a), 0, "close succeeds");
    assert_eq_test!(unistd::close(a), -EBADF, "double close is EBADF");
    // Numbers are never reused.
    let c = unistd::open("/dev/urandom");
    assert_eq_test!(c, 5, "no reuse after close");
    fd_map::reset_for_tests();
    pass!()
}

pub fn test_stdio_descriptors() -> TestResult {
    fd_map::reset_for_tests();
    assert_eq_test!(unistd::write(1, b"console line\n"), 13, "stdout accepts");
    assert_eq_test!(unistd::write(2, b"error line"), 10, "stderr accepts");
    let mut buf = [0u8; 4];
    assert_eq_test!(unistd::read(0, &mut buf), 0, "stdin is at EOF");
    pass!()
}

pub fn test_dev_random_reads() -> TestResult {
    fd_map::reset_for_tests();
    let fd = unistd::open("/dev/random");
    let mut buf = [0u8; 32];
    assert_eq_test!(unistd::read(fd, &mut buf), 32, "full buffer");
    assert_test!(buf.iter().any(|&b| b != 0), "bytes are not all zero");

    // Writing stirs the pool and reports success.
    assert_eq_test!(unistd::write(fd, b"entropy!"), 8, "seed accepted");
    unistd::close(fd);
    pass!()
}

pub fn test_file_io_through_vfs() -> TestResult {
    fd_map::reset_for_tests();
    keel_fs::vfs::reset_for_tests();

    let memfs: &'static Memfs = Box::leak(Box::new(Memfs::new(16, 64)));
    memfs.create_file("/motd", b"welcome to keel").unwrap();
    let root: &'static Dirent = Box::leak(Box::new(memfs.root()));
    keel_fs::vfs::mount("/data", root, "boot image").unwrap();

    let fd = unistd::open("/data/motd");
    assert_test!(fd >= 3, "open succeeded");

    let mut buf = [0u8; 7];
    assert_eq_test!(unistd::read(fd, &mut buf), 7, "first chunk");
    assert_eq_test!(&buf, b"welcome", "contents in order");

    // The cursor advanced; the next read continues.
    let mut rest = [0u8; 16];
    let n = unistd::read(fd, &mut rest);
    assert_eq_test!(n, 8, "remainder length");
    assert_eq_test!(&rest[..8], b" to keel", "remainder contents");

    // Seeks.
    assert_eq_test!(unistd::lseek(fd, 0, SEEK_SET), 0, "rewind");
    assert_eq_test!(unistd::lseek(fd, 3, SEEK_CUR), 3, "relative");
    assert_eq_test!(unistd::lseek(fd, 0, SEEK_END), 15, "from the end");

    assert_eq_test!(unistd::open("/data/missing"), -ENOENT, "missing file");
    unistd::close(fd);
    keel_fs::vfs::reset_for_tests();
    pass!()
}

pub fn test_socket_argument_validation() -> TestResult {
    let dev = make_host();
    assert_eq_test!(sockcalls::socket(7, SOCK_STREAM, 0), -EINVAL, "bad family");
    assert_eq_test!(sockcalls::socket(AF_INET, 99, 0), -EINVAL, "bad type");

    let fd = sockcalls::socket(AF_INET, SOCK_STREAM, 0);
    assert_test!(fd >= 3, "stream socket allocated");
    assert_eq_test!(
        sockcalls::listen(fd, 4),
        -EINVAL,
        "listen before bind refused"
    );
    unistd::close(fd);
    teardown(dev);
    pass!()
}

pub fn test_udp_socket_bind_and_rcvbuf() -> TestResult {
    let dev = make_host();
    let fd = sockcalls::socket(AF_INET, SOCK_DGRAM, 0);
    assert_test!(fd >= 3, "datagram socket allocated");

    let addr = Socket::new(HOST_IP, Port(8125)).to_user();
    assert_eq_test!(sockcalls::bind(fd, &addr), 0, "bind succeeds");

    // A second socket on the same port collides.
    let other = sockcalls::socket(AF_INET, SOCK_DGRAM, 0);
    assert_eq_test!(
        sockcalls::bind(other, &addr),
        -EADDRINUSE,
        "duplicate port refused"
    );

    assert_eq_test!(
        sockcalls::setsockopt(fd, 1, keel_abi::net::SO_RCVBUF, 4096),
        0,
        "SO_RCVBUF accepted"
    );
    unistd::close(fd);
    unistd::close(other);
    teardown(dev);
    pass!()
}

pub fn test_nonblocking_connect_returns_einprogress() -> TestResult {
    let dev = make_host();
    // Pre-resolve the peer so the SYN leaves immediately.
    inet::with_inet(dev, |inet| {
        inet.arp.insert(
            Ipv4Addr([10, 0, 0, 50]),
            MacAddr([2, 0, 0, 0, 0, 0x50]),
            keel_lib::clock::wall_s(),
        )
    });

    let fd = sockcalls::socket(AF_INET, SOCK_STREAM, 0);
    sockcalls::set_nonblocking(fd, keel_abi::net::O_NONBLOCK);

    let addr = Socket::new(Ipv4Addr([10, 0, 0, 50]), Port(80)).to_user();
    assert_eq_test!(
        sockcalls::connect(fd, &addr),
        -EINPROGRESS,
        "non-blocking connect is in progress"
    );
    assert_test!(
        CaptureDevice::mailbox_len(MAILBOX) > 0,
        "SYN went out immediately"
    );

    // Reads on the half-open socket would block.
    let mut buf = [0u8; 4];
    assert_eq_test!(
        unistd::read(fd, &mut buf),
        -EAGAIN as isize,
        "read before establishment"
    );
    unistd::close(fd);
    teardown(dev);
    pass!()
}

pub fn test_lseek_on_socket_is_espipe() -> TestResult {
    let dev = make_host();
    let fd = sockcalls::socket(AF_INET, SOCK_DGRAM, 0);
    assert_eq_test!(unistd::lseek(fd, 0, SEEK_SET), -ESPIPE as i64, "ESPIPE");
    unistd::close(fd);
    teardown(dev);
    pass!()
}

pub fn test_sendto_recvfrom_roundtrip_over_loopback_wire() -> TestResult {
    let dev = make_host();
    let fd = sockcalls::socket(AF_INET, SOCK_DGRAM, 0);
    let addr = Socket::new(HOST_IP, Port(9999)).to_user();
    assert_eq_test!(sockcalls::bind(fd, &addr), 0, "bind");

    // Loop a datagram back by injecting it as if it arrived on the wire.
    let payload = b"ping self";
    let src = Socket::new(Ipv4Addr([10, 0, 0, 50]), Port(5353));
    let mut datagram = alloc::vec::Vec::new();
    datagram.extend_from_slice(&src.port.to_network_bytes());
    datagram.extend_from_slice(&9999u16.to_be_bytes());
    datagram.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    datagram.extend_from_slice(&0u16.to_be_bytes());
    datagram.extend_from_slice(payload);

    let ip = keel_net::ip4::Ipv4Header {
        version: 4,
        header_len: 20,
        dscp_ecn: 0,
        total_len: (20 + datagram.len()) as u16,
        id: 0,
        flags_frag: 0,
        ttl: 64,
        protocol: keel_net::IPPROTO_UDP,
        checksum: 0,
        src: src.ip,
        dst: HOST_IP,
    };
    let pkt = keel_net::packetbuf::PacketBuf::from_raw_copy(&datagram).unwrap();
    keel_net::udp::handle_rx(dev, ip, pkt);

    let mut buf = [0u8; 32];
    let mut from = SockAddrIn::default();
    let n = sockcalls::recvfrom(fd, &mut buf, 0, Some(&mut from));
    assert_eq_test!(n, 9, "payload length");
    assert_eq_test!(&buf[..9], b"ping self", "payload");
    assert_eq_test!(u16::from_be(from.port), 5353, "source port reported");

    unistd::close(fd);
    teardown(dev);
    pass!()
}

define_test_suite!(
    posix,
    [
        test_fd_numbering_starts_above_stdio,
        test_stdio_descriptors,
        test_dev_random_reads,
        test_file_io_through_vfs,
        test_socket_argument_validation,
        test_udp_socket_bind_and_rcvbuf,
        test_nonblocking_connect_returns_einprogress,
        test_lseek_on_socket_is_espipe,
        test_sendto_recvfrom_roundtrip_over_loopback_wire,
    ]
);
