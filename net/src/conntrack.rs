//! Connection tracking.
//!
//! A flow table keyed by quintuple. Every flow is stored once and indexed
//! twice — by its original-direction quadruple and by the reply-direction
//! quadruple — so lookups from either side land on the same entry.
//!
//! UDP and ICMP use simple tracking: the first packet creates an
//! `Unconfirmed` entry, a confirmed egress moves it to `New`, and the first
//! reply promotes it to `Established`. TCP entries are driven by the TCP
//! state machine through the `tcp_*` hooks.
//!
//! Timeouts are absolute wall-clock deadlines; a periodic flush removes
//! entries whose deadline passed. Entries can be serialized for a live
//! handoff and restored without renegotiating flows — entries carrying an
//! `on_close` delegate are skipped, delegates cannot be restored.

extern crate alloc;

use alloc::vec::Vec;

use alloc::collections::BTreeMap;

use keel_lib::klog_debug;

use super::types::{IpProtocol, Socket};

// =============================================================================
// Keys
// =============================================================================

/// `(src, dst)` endpoint pair — one direction of a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quadruple {
    pub src: Socket,
    pub dst: Socket,
}

impl Quadruple {
    pub const fn new(src: Socket, dst: Socket) -> Self {
        Self { src, dst }
    }

    /// The reply direction.
    pub const fn swap(self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

/// Quadruple plus protocol — the full flow key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quintuple {
    pub quad: Quadruple,
    pub proto: IpProtocol,
}

// =============================================================================
// Entries
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CtState {
    Unconfirmed = 0,
    New = 1,
    Established = 2,
    Related = 3,
}

impl CtState {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Unconfirmed),
            1 => Some(Self::New),
            2 => Some(Self::Established),
            3 => Some(Self::Related),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Unconfirmed => "UNCONFIRMED",
            Self::New => "NEW",
            Self::Established => "ESTABLISHED",
            Self::Related => "RELATED",
        }
    }
}

pub const CT_FLAG_UNREPLIED: u8 = 1 << 0;
pub const CT_FLAG_ASSURED: u8 = 1 << 1;

pub type OnCloseFn = fn(&Entry);

#[derive(Clone)]
pub struct Entry {
    pub first: Quadruple,
    pub second: Quadruple,
    pub proto: IpProtocol,
    pub state: CtState,
    pub flags: u8,
    /// Absolute wall-clock deadline in seconds.
    pub timeout_s: u64,
    pub on_close: Option<OnCloseFn>,
}

/// Stable handle to a tracked flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtId(usize);

// =============================================================================
// Timeout policy
// =============================================================================

/// Per-state timeout in seconds for one protocol.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutSet {
    pub unconfirmed: u64,
    pub confirmed: u64,
    pub established: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    pub tcp: TimeoutSet,
    pub udp: TimeoutSet,
    pub icmp: TimeoutSet,
}

impl Timeouts {
    pub const DEFAULT: Self = Self {
        tcp: TimeoutSet {
            unconfirmed: 10,
            confirmed: 120,
            established: 86_400,
        },
        udp: TimeoutSet {
            unconfirmed: 10,
            confirmed: 30,
            established: 180,
        },
        icmp: TimeoutSet {
            unconfirmed: 10,
            confirmed: 30,
            established: 30,
        },
    };

    fn for_proto(&self, proto: IpProtocol) -> TimeoutSet {
        match proto {
            IpProtocol::Tcp => self.tcp,
            IpProtocol::Udp => self.udp,
            IpProtocol::Icmp | IpProtocol::Icmpv6 => self.icmp,
        }
    }
}

// =============================================================================
// Conntrack
// =============================================================================

/// Default flush interval in seconds.
pub const CT_FLUSH_INTERVAL_S: u64 = 10;

pub struct Conntrack {
    /// Flow storage; slots are reused through the free list.
    slab: Vec<Option<Entry>>,
    free: Vec<usize>,
    /// Two keys per live flow, both pointing at the same slab slot.
    index: BTreeMap<Quintuple, usize>,
    /// 0 = unlimited.
    pub maximum_entries: usize,
    pub timeouts: Timeouts,
    pub flush_interval_s: u64,
}

impl Conntrack {
    pub const fn new() -> Self {
        Self {
            slab: Vec::new(),
            free: Vec::new(),
            index: BTreeMap::new(),
            maximum_entries: 0,
            timeouts: Timeouts::DEFAULT,
            flush_interval_s: CT_FLUSH_INTERVAL_S,
        }
    }

    pub fn with_limit(max_entries: usize) -> Self {
        let mut ct = Self::new();
        ct.maximum_entries = max_entries;
        ct
    }

    /// Number of tracked flows (each counted once, not per key).
    pub fn number_of_entries(&self) -> usize {
        self.index.len() / 2
    }

    /// Number of index keys (two per flow).
    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    pub fn entry(&self, id: CtId) -> Option<&Entry> {
        self.slab.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn entry_mut(&mut self, id: CtId) -> Option<&mut Entry> {
        self.slab.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    /// Look up a flow from either direction.
    pub fn get(&self, quad: Quadruple, proto: IpProtocol) -> Option<CtId> {
        self.index
            .get(&Quintuple { quad, proto })
            .copied()
            .map(CtId)
    }

    /// Track an incoming packet: find its flow or create one.
    ///
    /// For UDP/ICMP this is the whole state machine: a packet matching the
    /// reply direction of a `New` flow promotes it to `Established`. TCP
    /// ingress also lands here first; the TCP layer refines the state via
    /// the `tcp_*` hooks afterwards.
    pub fn in_(&mut self, quad: Quadruple, proto: IpProtocol, now_s: u64) -> Option<CtId> {
        let Some(id) = self.get(quad, proto) else {
            return self.add_entry(quad, proto, now_s);
        };

        let timeouts = self.timeouts.for_proto(proto);
        let entry = self.entry_mut(id)?;

        if entry.state == CtState::New && quad == entry.second {
            entry.state = CtState::Established;
            entry.flags &= !CT_FLAG_UNREPLIED;
        }

        let timeout = if entry.state == CtState::Established {
            timeouts.established
        } else {
            timeouts.confirmed
        };
        entry.timeout_s = now_s + timeout;
        Some(id)
    }

    /// Confirm a flow after its first packet was actually delivered or
    /// forwarded: `Unconfirmed` becomes `New`.
    pub fn confirm(&mut self, quad: Quadruple, proto: IpProtocol, now_s: u64) -> Option<CtId> {
        let id = match self.get(quad, proto) {
            Some(id) => id,
            // The packet may have been rewritten; try the reply direction.
            None => self.get(quad.swap(), proto)?,
        };
        let timeouts = self.timeouts.for_proto(proto);
        let entry = self.entry_mut(id)?;
        if entry.state == CtState::Unconfirmed {
            entry.state = CtState::New;
            entry.timeout_s = now_s + timeouts.confirmed;
        }
        Some(id)
    }

    fn add_entry(&mut self, quad: Quadruple, proto: IpProtocol, now_s: u64) -> Option<CtId> {
        if self.maximum_entries != 0 && self.number_of_entries() + 1 > self.maximum_entries {
            klog_debug!("conntrack: entry limit {} reached", self.maximum_entries);
            return None;
        }

        let timeouts = self.timeouts.for_proto(proto);
        let entry = Entry {
            first: quad,
            second: quad.swap(),
            proto,
            state: CtState::Unconfirmed,
            flags: CT_FLAG_UNREPLIED,
            timeout_s: now_s + timeouts.unconfirmed,
            on_close: None,
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slab[slot] = Some(entry);
                slot
            }
            None => {
                self.slab.push(Some(entry));
                self.slab.len() - 1
            }
        };

        self.index.insert(Quintuple { quad, proto }, slot);
        self.index.insert(
            Quintuple {
                quad: quad.swap(),
                proto,
            },
            slot,
        );

        Some(CtId(slot))
    }

    /// Re-key one direction of a flow (NAT-style rewrite).
    pub fn update_entry(
        &mut self,
        proto: IpProtocol,
        old_quad: Quadruple,
        new_quad: Quadruple,
    ) -> Option<CtId> {
        let old_key = Quintuple {
            quad: old_quad,
            proto,
        };
        let slot = self.index.remove(&old_key)?;

        {
            let entry = self.slab[slot].as_mut()?;
            if entry.first == old_quad {
                entry.first = new_quad;
            } else {
                entry.second = new_quad;
            }
        }

        self.index.insert(
            Quintuple {
                quad: new_quad,
                proto,
            },
            slot,
        );
        Some(CtId(slot))
    }

    /// Mark a flow established with the long timeout (TCP handshake done).
    pub fn tcp_established(&mut self, id: CtId, now_s: u64) {
        let established = self.timeouts.tcp.established;
        if let Some(entry) = self.entry_mut(id) {
            entry.state = CtState::Established;
            entry.flags &= !CT_FLAG_UNREPLIED;
            entry.flags |= CT_FLAG_ASSURED;
            entry.timeout_s = now_s + established;
        }
    }

    /// Shorten a flow's timeout (FIN/RST seen, or TIME_WAIT completing).
    pub fn tcp_closing(&mut self, id: CtId, now_s: u64) {
        let confirmed = self.timeouts.tcp.confirmed;
        if let Some(entry) = self.entry_mut(id) {
            entry.timeout_s = now_s + confirmed.min(30);
        }
    }

    /// Remove one flow immediately, invoking its close delegate.
    pub fn remove(&mut self, id: CtId) {
        let Some(entry) = self.slab.get_mut(id.0).and_then(|slot| slot.take()) else {
            return;
        };
        self.index.remove(&Quintuple {
            quad: entry.first,
            proto: entry.proto,
        });
        self.index.remove(&Quintuple {
            quad: entry.second,
            proto: entry.proto,
        });
        self.free.push(id.0);
        if let Some(on_close) = entry.on_close {
            on_close(&entry);
        }
    }

    /// Drop every flow whose absolute deadline has passed. Returns the
    /// number removed. Driven by the periodic flush timer.
    pub fn remove_expired(&mut self, now_s: u64) -> usize {
        let mut doomed: Vec<usize> = Vec::new();
        for (slot, entry) in self.slab.iter().enumerate() {
            if let Some(entry) = entry {
                if entry.timeout_s <= now_s {
                    doomed.push(slot);
                }
            }
        }
        for slot in &doomed {
            self.remove(CtId(*slot));
        }
        doomed.len()
    }

    /// Drop everything (test teardown / handoff replacement).
    pub fn clear(&mut self) {
        self.slab.clear();
        self.free.clear();
        self.index.clear();
    }

    // -----------------------------------------------------------------------
    // Serialization for live handoff
    // -----------------------------------------------------------------------

    const ENTRY_WIRE_SIZE: usize = 12 + 12 + 1 + 1 + 1 + 8;

    fn serialize_quad(quad: &Quadruple, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&quad.src.ip.0);
        buf.extend_from_slice(&quad.src.port.to_network_bytes());
        buf.extend_from_slice(&quad.dst.ip.0);
        buf.extend_from_slice(&quad.dst.port.to_network_bytes());
    }

    fn deserialize_quad(buf: &[u8]) -> Quadruple {
        use super::types::{Ipv4Addr, Port};
        Quadruple {
            src: Socket::new(
                Ipv4Addr([buf[0], buf[1], buf[2], buf[3]]),
                Port::from_network_bytes([buf[4], buf[5]]),
            ),
            dst: Socket::new(
                Ipv4Addr([buf[6], buf[7], buf[8], buf[9]]),
                Port::from_network_bytes([buf[10], buf[11]]),
            ),
        }
    }

    /// Serialize all delegate-free flows: a leading `u64` count followed by
    /// fixed-size entries. Flows with an `on_close` handler are skipped —
    /// delegates cannot cross a handoff.
    pub fn serialize_to(&self, buf: &mut Vec<u8>) {
        let mut count: u64 = 0;
        let count_pos = buf.len();
        buf.extend_from_slice(&0u64.to_le_bytes());

        let mut skipped = 0usize;
        for entry in self.slab.iter().flatten() {
            if entry.on_close.is_some() {
                skipped += 1;
                continue;
            }
            Self::serialize_quad(&entry.first, buf);
            Self::serialize_quad(&entry.second, buf);
            buf.push(entry.proto.as_u8());
            buf.push(entry.state as u8);
            buf.push(entry.flags);
            buf.extend_from_slice(&entry.timeout_s.to_le_bytes());
            count += 1;
        }

        buf[count_pos..count_pos + 8].copy_from_slice(&count.to_le_bytes());
        if skipped > 0 {
            klog_debug!("conntrack: {} entries not serialized", skipped);
        }
    }

    /// Restore flows from [`serialize_to`] output, double-indexing each.
    /// Returns the number of bytes consumed, or `None` on a short buffer.
    pub fn deserialize_from(&mut self, buf: &[u8]) -> Option<usize> {
        if buf.len() < 8 {
            return None;
        }
        let count = u64::from_le_bytes(buf[..8].try_into().ok()?) as usize;
        let mut pos = 8usize;

        for _ in 0..count {
            if buf.len() < pos + Self::ENTRY_WIRE_SIZE {
                return None;
            }
            let first = Self::deserialize_quad(&buf[pos..]);
            let second = Self::deserialize_quad(&buf[pos + 12..]);
            let proto = IpProtocol::from_u8(buf[pos + 24])?;
            let state = CtState::from_raw(buf[pos + 25])?;
            let flags = buf[pos + 26];
            let timeout_s = u64::from_le_bytes(buf[pos + 27..pos + 35].try_into().ok()?);
            pos += Self::ENTRY_WIRE_SIZE;

            let entry = Entry {
                first,
                second,
                proto,
                state,
                flags,
                timeout_s,
                on_close: None,
            };

            let slot = match self.free.pop() {
                Some(slot) => {
                    self.slab[slot] = Some(entry);
                    slot
                }
                None => {
                    self.slab.push(Some(entry));
                    self.slab.len() - 1
                }
            };
            self.index.insert(Quintuple { quad: first, proto }, slot);
            self.index.insert(
                Quintuple {
                    quad: second,
                    proto,
                },
                slot,
            );
        }

        Some(pos)
    }
}

impl Default for Conntrack {
    fn default() -> Self {
        Self::new()
    }
}
