//! Path MTU cache (RFC 1191 / RFC 8201).
//!
//! One cache per interface, keyed by destination `(address, port)`. Entries
//! only ever shrink; an ICMP "Fragmentation Needed" / "Packet Too Big" with
//! a bogus next-hop MTU (pre-RFC-1191 routers sent zero) falls back to an
//! estimate derived from the quoted original packet. A periodic ageing
//! timer drops entries so the path can be re-probed for recovery.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::types::Socket;
use super::{IPV4_MIN_MTU, IPV6_MIN_MTU};

/// Default entry lifetime (RFC 1191 recommends 10 minutes), in seconds.
pub const PMTU_DEFAULT_AGE_S: u64 = 600;

#[derive(Clone, Copy, Debug)]
struct PmtuEntry {
    mtu: u16,
    /// Wall-clock second the entry was last reduced.
    stamp_s: u64,
}

/// Per-destination path MTU map. Single-writer: the owning `Inet`.
pub struct PmtuCache {
    paths: BTreeMap<Socket, PmtuEntry>,
    /// Whether discovery is enabled at all; disabling clears the cache.
    enabled: bool,
    /// Entry lifetime for the ageing sweep.
    max_age_s: u64,
}

impl PmtuCache {
    pub const fn new() -> Self {
        Self {
            paths: BTreeMap::new(),
            enabled: false,
            max_age_s: PMTU_DEFAULT_AGE_S,
        }
    }

    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
        if !on {
            self.paths.clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_max_age_s(&mut self, age: u64) {
        self.max_age_s = age;
    }

    /// Cached PMTU toward `dest`, or 0 when unknown.
    pub fn pmtu(&self, dest: Socket) -> u16 {
        self.paths.get(&dest).map(|e| e.mtu).unwrap_or(0)
    }

    /// Record a discovered MTU toward `dest`.
    ///
    /// `reported_mtu` is the next-hop MTU carried by the ICMP error; when it
    /// is below the protocol minimum it is treated as bogus (legacy router)
    /// and estimated from `original_total_len`, the quoted packet's total
    /// length, as `max(min_mtu, original_total_len - 20)`.
    ///
    /// The cache is monotone: an update never raises a stored value.
    /// Returns the value now cached (0 = nothing usable).
    pub fn update_path(
        &mut self,
        dest: Socket,
        reported_mtu: u16,
        is_v6: bool,
        original_total_len: u16,
        now_s: u64,
    ) -> u16 {
        if !self.enabled {
            return 0;
        }

        let min_mtu = if is_v6 { IPV6_MIN_MTU } else { IPV4_MIN_MTU };
        let mtu = if reported_mtu >= min_mtu {
            reported_mtu
        } else if original_total_len > 20 {
            // Legacy router sent no usable MTU: assume the quoted packet
            // was one IPv4 header too big for the next hop.
            (original_total_len - 20).max(min_mtu)
        } else {
            return self.pmtu(dest);
        };

        match self.paths.get_mut(&dest) {
            Some(entry) => {
                if mtu < entry.mtu {
                    entry.mtu = mtu;
                    entry.stamp_s = now_s;
                }
                entry.mtu
            }
            None => {
                self.paths.insert(
                    dest,
                    PmtuEntry {
                        mtu,
                        stamp_s: now_s,
                    },
                );
                mtu
            }
        }
    }

    /// Forget one path.
    pub fn remove_path(&mut self, dest: Socket) -> bool {
        self.paths.remove(&dest).is_some()
    }

    /// Drop everything.
    pub fn flush(&mut self) {
        self.paths.clear();
    }

    /// Ageing sweep: drop entries older than `max_age_s`, returning the
    /// destinations removed so transports can re-probe.
    pub fn age(&mut self, now_s: u64) -> Vec<Socket> {
        let max_age = self.max_age_s;
        let mut expired = Vec::new();
        self.paths.retain(|dest, entry| {
            if now_s.saturating_sub(entry.stamp_s) >= max_age {
                expired.push(*dest);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Default for PmtuCache {
    fn default() -> Self {
        Self::new()
    }
}
