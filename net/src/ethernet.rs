//! Ethernet framing and EtherType demux.
//!
//! Incoming frames are dispatched by EtherType to {IPv4, ARP, IPv6};
//! unknown types are counted and ignored. Outbound frames pre-reserve the
//! 14-byte header in the packet's headroom so upper layers never shift
//! payload.

use core::sync::atomic::{AtomicU64, Ordering};

use super::packetbuf::PacketBuf;
use super::types::{DevIndex, EtherType, MacAddr, NetError};
use super::{ETH_ADDR_LEN, ETH_HEADER_LEN};

/// Frames dropped because their EtherType had no handler.
pub static UNKNOWN_ETHERTYPE_DROPS: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

/// Parse and consume the Ethernet header at the packet's head.
pub fn pull_header(pkt: &mut PacketBuf) -> Option<EthHeader> {
    pkt.set_l2(pkt.head());
    let header = pkt.pull_header(ETH_HEADER_LEN).ok()?;
    Some(EthHeader {
        dst: MacAddr([header[0], header[1], header[2], header[3], header[4], header[5]]),
        src: MacAddr([header[6], header[7], header[8], header[9], header[10], header[11]]),
        ethertype: u16::from_be_bytes([header[12], header[13]]),
    })
}

/// Prepend an Ethernet header into the packet's headroom.
pub fn push_frame_header(
    pkt: &mut PacketBuf,
    dst: MacAddr,
    src: MacAddr,
    ethertype: u16,
) -> Result<(), NetError> {
    let header = pkt.push_header(ETH_HEADER_LEN)?;
    header[0..ETH_ADDR_LEN].copy_from_slice(&dst.0);
    header[ETH_ADDR_LEN..2 * ETH_ADDR_LEN].copy_from_slice(&src.0);
    header[2 * ETH_ADDR_LEN..ETH_HEADER_LEN].copy_from_slice(&ethertype.to_be_bytes());
    let l2 = pkt.head();
    pkt.set_l2(l2);
    Ok(())
}

/// Ingress entry point: demux one frame from `dev` to its protocol.
///
/// Frames not addressed to us (unicast mismatch, non-broadcast,
/// non-multicast) are dropped silently — promiscuous operation is a driver
/// concern.
pub fn handle_frame(dev: DevIndex, mut pkt: PacketBuf) {
    let Some(header) = pull_header(&mut pkt) else {
        return;
    };

    let our_mac = super::inet::mac_of(dev);
    if let Some(mac) = our_mac {
        if header.dst != mac && !header.dst.is_broadcast() && !header.dst.is_multicast() {
            return;
        }
    }

    match EtherType::from_u16(header.ethertype) {
        Some(EtherType::Ipv4) => super::ip4::handle_rx(dev, pkt),
        Some(EtherType::Arp) => super::inet::arp_input(dev, pkt),
        Some(EtherType::Ipv6) => super::ip6::handle_rx(dev, pkt),
        None => {
            UNKNOWN_ETHERTYPE_DROPS.fetch_add(1, Ordering::Relaxed);
        }
    }
}
