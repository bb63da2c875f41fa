//! Packet pool and buffer regression tests.

use keel_lib::testing::TestResult;
use keel_lib::{assert_eq_test, assert_test, define_test_suite, fail, pass};

use crate::packetbuf::{HEADROOM, PacketBuf, transport_checksum, verify_transport_checksum};
use crate::pool::{PACKET_POOL, POOL_SIZE};
use crate::types::Ipv4Addr;

fn init_pool() {
    PACKET_POOL.init();
}

pub fn test_pool_alloc_release_cycle() -> TestResult {
    init_pool();
    let before = PACKET_POOL.available();

    {
        let pkt = match PacketBuf::alloc() {
            Some(p) => p,
            None => return fail!("pool exhausted at test start"),
        };
        assert_eq_test!(PACKET_POOL.available(), before - 1, "one slot taken");
        drop(pkt);
    }
    assert_eq_test!(PACKET_POOL.available(), before, "drop released the slot");
    pass!()
}

pub fn test_pool_exhaustion_returns_none() -> TestResult {
    init_pool();
    let mut held = alloc::vec::Vec::new();
    while let Some(pkt) = PacketBuf::alloc() {
        held.push(pkt);
        if held.len() > POOL_SIZE {
            return fail!("allocated more buffers than the pool holds");
        }
    }
    assert_test!(
        PacketBuf::alloc().is_none(),
        "exhausted pool refuses allocation"
    );
    drop(held);
    assert_test!(PacketBuf::alloc().is_some(), "slots return after drop");
    pass!()
}

pub fn test_tx_headroom_push() -> TestResult {
    init_pool();
    let mut pkt = PacketBuf::alloc().unwrap();
    assert_eq_test!(pkt.head(), HEADROOM, "TX buffer starts after headroom");
    assert_eq_test!(pkt.len(), 0, "empty payload");

    pkt.append(b"payload").unwrap();
    assert_eq_test!(pkt.len(), 7, "appended payload");

    // Prepend a fake 8-byte header; payload must not move.
    {
        let header = pkt.push_header(8).unwrap();
        header.copy_from_slice(b"HDRHDRHD");
    }
    assert_eq_test!(pkt.len(), 15, "header extends the front");
    assert_eq_test!(&pkt.payload()[..8], b"HDRHDRHD", "header bytes first");
    assert_eq_test!(&pkt.payload()[8..], b"payload", "payload untouched");

    // Consume it again, as the RX path would.
    let header = pkt.pull_header(8).unwrap();
    assert_eq_test!(header, b"HDRHDRHD", "pulled header bytes");
    assert_eq_test!(pkt.payload(), b"payload", "back to payload");
    pass!()
}

pub fn test_push_beyond_headroom_fails() -> TestResult {
    init_pool();
    let mut pkt = PacketBuf::alloc().unwrap();
    assert_test!(
        pkt.push_header(HEADROOM as usize + 1).is_err(),
        "cannot push past the headroom"
    );
    assert_test!(pkt.push_header(HEADROOM as usize).is_ok(), "exact fit ok");
    pass!()
}

pub fn test_rx_copy_and_layer_offsets() -> TestResult {
    init_pool();
    let frame: alloc::vec::Vec<u8> = (0..64u8).collect();
    let mut pkt = PacketBuf::from_raw_copy(&frame).unwrap();
    assert_eq_test!(pkt.head(), 0, "RX data starts at offset zero");
    assert_eq_test!(pkt.len(), 64, "full frame");

    pkt.set_l2(0);
    let _ = pkt.pull_header(14);
    pkt.set_l3(14);
    let _ = pkt.pull_header(20);
    pkt.set_l4(34);

    assert_eq_test!(pkt.l3_header().len(), 20, "l3 view spans the IP header");
    assert_eq_test!(pkt.l3_header()[0], 14, "l3 view starts at offset 14");
    assert_eq_test!(pkt.l4_segment().len(), 30, "l4 view runs to the tail");
    pass!()
}

pub fn test_chaining() -> TestResult {
    init_pool();
    let mut first = PacketBuf::alloc().unwrap();
    first.append(b"one").unwrap();
    let mut second = PacketBuf::alloc().unwrap();
    second.append(b"two").unwrap();
    let mut third = PacketBuf::alloc().unwrap();
    third.append(b"three").unwrap();

    first.chain(second);
    first.chain(third);
    assert_eq_test!(first.chain_len(), 3, "chain of three");

    let mut next = first.take_chain().unwrap();
    assert_eq_test!(next.payload(), b"two", "chain order preserved");
    let tail = next.take_chain().unwrap();
    assert_eq_test!(tail.payload(), b"three", "tail follows");
    assert_test!(!first.has_chain(), "head detached");
    pass!()
}

pub fn test_transport_checksum_roundtrip() -> TestResult {
    let src = Ipv4Addr([10, 0, 0, 1]);
    let dst = Ipv4Addr([10, 0, 0, 2]);

    // A fake 20-byte TCP header + payload with a zeroed checksum field.
    let mut segment = alloc::vec![0u8; 28];
    segment[0] = 0x1F; // src port 8080
    segment[1] = 0x90;
    segment[12] = 5 << 4;
    segment[20..28].copy_from_slice(b"testdata");

    let csum = transport_checksum(src, dst, 6, &segment, 16);
    segment[16..18].copy_from_slice(&csum.to_be_bytes());
    assert_test!(
        verify_transport_checksum(src, dst, 6, &segment),
        "checksum verifies after patching"
    );

    segment[20] ^= 0xFF;
    assert_test!(
        !verify_transport_checksum(src, dst, 6, &segment),
        "corruption detected"
    );
    pass!()
}

define_test_suite!(
    packetbuf,
    [
        test_pool_alloc_release_cycle,
        test_pool_exhaustion_returns_none,
        test_tx_headroom_push,
        test_push_beyond_headroom_fails,
        test_rx_copy_and_layer_offsets,
        test_chaining,
        test_transport_checksum_roundtrip,
    ]
);
