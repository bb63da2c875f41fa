//! ICMPv4: echo, destination unreachable, time exceeded, and the error
//! plumbing toward the transports.
//!
//! Only the tabulated types are recognised; unknown types never generate a
//! response.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use keel_lib::{IrqMutex, klog_debug};

use super::ip4::{self, Ipv4Header};
use super::packetbuf::PacketBuf;
use super::types::{DevIndex, Ipv4Addr};
use super::{IPPROTO_ICMP, IPV4_HEADER_LEN, fold_checksum, ones_complement_sum};

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

pub const ICMP_CODE_NET_UNREACHABLE: u8 = 0;
pub const ICMP_CODE_HOST_UNREACHABLE: u8 = 1;
pub const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;
pub const ICMP_CODE_FRAGMENTATION_NEEDED: u8 = 4;

pub const ICMP_HEADER_LEN: usize = 8;

/// How much of the offending packet an ICMP error quotes: the IP header
/// plus 8 payload bytes (RFC 792).
pub const ICMP_QUOTE_LEN: usize = IPV4_HEADER_LEN + 8;

// =============================================================================
// Error descriptor
// =============================================================================

/// An ICMP-reported transport error, as routed by `inet::error_report`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IcmpError {
    pub icmp_type: u8,
    pub code: u8,
    /// Next-hop MTU from a Fragmentation Needed message (0 otherwise).
    pub mtu: u16,
}

impl IcmpError {
    pub const fn new(icmp_type: u8, code: u8, mtu: u16) -> Self {
        Self {
            icmp_type,
            code,
            mtu,
        }
    }

    /// A "Fragmentation Needed and DF set" error.
    pub const fn is_too_big(&self) -> bool {
        self.icmp_type == ICMP_DEST_UNREACHABLE && self.code == ICMP_CODE_FRAGMENTATION_NEEDED
    }

    /// The next-hop MTU when this error carries one.
    pub const fn next_hop_mtu(&self) -> Option<u16> {
        if self.is_too_big() { Some(self.mtu) } else { None }
    }

    /// Errors that terminate a connection attempt (port/host unreachable).
    pub const fn is_fatal(&self) -> bool {
        self.icmp_type == ICMP_DEST_UNREACHABLE && !self.is_too_big()
    }
}

// =============================================================================
// Echo delegate table
// =============================================================================

/// Delegate invoked for a matching echo reply: `(from, id, seq, payload)`.
pub type EchoReplyFn = fn(Ipv4Addr, u16, u16, &[u8]);

static ECHO_HANDLERS: IrqMutex<BTreeMap<u16, EchoReplyFn>> = IrqMutex::new(BTreeMap::new());

/// Register interest in echo replies carrying `id`.
pub fn on_echo_reply(id: u16, handler: EchoReplyFn) {
    ECHO_HANDLERS.lock().insert(id, handler);
}

pub fn clear_echo_handler(id: u16) {
    ECHO_HANDLERS.lock().remove(&id);
}

// =============================================================================
// Ingress
// =============================================================================

/// Process an ICMP message whose head sits at the ICMP header.
pub fn handle_rx(dev: DevIndex, ip: Ipv4Header, mut pkt: PacketBuf) {
    let data = pkt.payload();
    if data.len() < ICMP_HEADER_LEN {
        return;
    }
    if fold_checksum(ones_complement_sum(data)) != 0 {
        klog_debug!("{}: icmp checksum mismatch", dev);
        return;
    }

    let icmp_type = data[0];
    let code = data[1];

    match icmp_type {
        ICMP_ECHO_REQUEST => {
            let id = u16::from_be_bytes([data[4], data[5]]);
            let seq = u16::from_be_bytes([data[6], data[7]]);
            klog_debug!("{}: echo request from {} id={} seq={}", dev, ip.src, id, seq);
            // Reuse the message in place: flip the type, recompute, return
            // to sender. Identifier, sequence and payload are preserved.
            {
                let data = pkt.payload_mut();
                data[0] = ICMP_ECHO_REPLY;
                data[2] = 0;
                data[3] = 0;
                let csum = fold_checksum(ones_complement_sum(data));
                data[2..4].copy_from_slice(&csum.to_be_bytes());
            }
            ip4::ship(dev, ip.src, IPPROTO_ICMP, pkt);
        }
        ICMP_ECHO_REPLY => {
            let id = u16::from_be_bytes([data[4], data[5]]);
            let seq = u16::from_be_bytes([data[6], data[7]]);
            let handler = ECHO_HANDLERS.lock().get(&id).copied();
            if let Some(handler) = handler {
                handler(ip.src, id, seq, &pkt.payload()[ICMP_HEADER_LEN..]);
            }
        }
        ICMP_DEST_UNREACHABLE => {
            let mtu = u16::from_be_bytes([data[6], data[7]]);
            let err = IcmpError::new(icmp_type, code, mtu);
            let original: Vec<u8> = data[ICMP_HEADER_LEN..].to_vec();
            super::inet::error_report(dev, err, &original);
        }
        ICMP_TIME_EXCEEDED => {
            let err = IcmpError::new(icmp_type, code, 0);
            let original: Vec<u8> = data[ICMP_HEADER_LEN..].to_vec();
            super::inet::error_report(dev, err, &original);
        }
        _ => {
            // Unrecognised types are ignored, never answered.
        }
    }
}

// =============================================================================
// Egress
// =============================================================================

/// Send an echo request.
pub fn send_echo(dev: DevIndex, dst: Ipv4Addr, id: u16, seq: u16, payload: &[u8]) {
    let Some(mut pkt) = PacketBuf::alloc() else {
        return;
    };
    let mut header = [0u8; ICMP_HEADER_LEN];
    header[0] = ICMP_ECHO_REQUEST;
    header[4..6].copy_from_slice(&id.to_be_bytes());
    header[6..8].copy_from_slice(&seq.to_be_bytes());
    if pkt.append(&header).is_err() || pkt.append(payload).is_err() {
        return;
    }
    finalize_checksum(&mut pkt);
    ip4::ship(dev, dst, IPPROTO_ICMP, pkt);
}

/// Send a Time Exceeded error quoting `original` (an IP packet from its
/// header onward). Used by the router when TTL hits zero.
pub fn send_time_exceeded(dev: DevIndex, dst: Ipv4Addr, original: &[u8]) {
    send_error(dev, dst, ICMP_TIME_EXCEEDED, 0, 0, original);
}

/// Send a Destination Unreachable error with the given code.
pub fn send_dest_unreachable(dev: DevIndex, dst: Ipv4Addr, code: u8, original: &[u8]) {
    send_error(dev, dst, ICMP_DEST_UNREACHABLE, code, 0, original);
}

/// Send a Fragmentation Needed error advertising `mtu`.
pub fn send_too_big(dev: DevIndex, dst: Ipv4Addr, mtu: u16, original: &[u8]) {
    send_error(
        dev,
        dst,
        ICMP_DEST_UNREACHABLE,
        ICMP_CODE_FRAGMENTATION_NEEDED,
        mtu,
        original,
    );
}

fn send_error(dev: DevIndex, dst: Ipv4Addr, icmp_type: u8, code: u8, mtu: u16, original: &[u8]) {
    let Some(mut pkt) = PacketBuf::alloc() else {
        return;
    };
    let mut header = [0u8; ICMP_HEADER_LEN];
    header[0] = icmp_type;
    header[1] = code;
    header[6..8].copy_from_slice(&mtu.to_be_bytes());
    let quote = &original[..original.len().min(ICMP_QUOTE_LEN)];
    if pkt.append(&header).is_err() || pkt.append(quote).is_err() {
        return;
    }
    finalize_checksum(&mut pkt);
    ip4::ship(dev, dst, IPPROTO_ICMP, pkt);
}

fn finalize_checksum(pkt: &mut PacketBuf) {
    let data = pkt.payload_mut();
    data[2] = 0;
    data[3] = 0;
    let csum = fold_checksum(ones_complement_sum(data));
    data[2..4].copy_from_slice(&csum.to_be_bytes());
}
