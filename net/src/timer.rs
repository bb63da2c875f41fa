//! Data-driven timer wheel for the network stack.
//!
//! All periodic and one-shot network timers (ARP cache flush, NDP cache
//! flush, PMTU ageing, conntrack flush, TCP retransmit and TIME_WAIT) run
//! through this wheel with typed dispatch: entries carry a [`TimerKind`]
//! and an opaque `key` naming the resource, never a bare function pointer.
//!
//! The wheel has 256 slots of one tick (1 ms) each; longer delays ride the
//! absolute `deadline_tick` across rotations. Expired entries are collected
//! under the lock and dispatched outside it, so handlers may schedule new
//! timers freely. Per-advance work is bounded by [`MAX_TIMERS_PER_TICK`].

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use keel_lib::IrqMutex;

const NUM_SLOTS: usize = 256;

/// Upper bound on entries fired per [`advance_to`] call; the remainder
/// fires on the next call.
pub const MAX_TIMERS_PER_TICK: usize = 32;

/// Which subsystem a timer belongs to. Dispatch matches exhaustively, so a
/// new variant forces every dispatcher to handle it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Periodic ARP cache flush.
    ArpFlush,
    /// Periodic IPv6 neighbor cache flush.
    NeighborFlush6,
    /// Periodic PMTU cache ageing.
    PmtuAge,
    /// Periodic conntrack expiry sweep.
    ConntrackFlush,
    /// TCP retransmission timeout for one connection.
    TcpRetransmit,
    /// TCP 2×MSL expiry for one connection.
    TcpTimeWait,
}

/// Opaque cancellation handle. Monotone, never reused.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerToken(u64);

impl TimerToken {
    pub const INVALID: Self = Self(0);
}

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(1);

struct TimerEntry {
    deadline_tick: u64,
    kind: TimerKind,
    key: u32,
    token: TimerToken,
    /// Reload interval for periodic timers; 0 = single-shot.
    period_ticks: u64,
    cancelled: bool,
}

/// A fired timer, handed to the dispatcher.
#[derive(Clone, Copy, Debug)]
pub struct Expired {
    pub kind: TimerKind,
    pub key: u32,
    pub token: TimerToken,
}

struct WheelInner {
    slots: [Vec<TimerEntry>; NUM_SLOTS],
    current_tick: u64,
}

pub struct TimerWheel {
    inner: IrqMutex<WheelInner>,
}

/// The stack-wide timer wheel, advanced from the platform timer tick.
pub static NET_TIMERS: TimerWheel = TimerWheel::new();

impl TimerWheel {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(WheelInner {
                slots: [const { Vec::new() }; NUM_SLOTS],
                current_tick: 0,
            }),
        }
    }

    /// Schedule a single-shot timer `delay_ticks` from now.
    pub fn schedule(&self, kind: TimerKind, key: u32, delay_ticks: u64) -> TimerToken {
        self.schedule_inner(kind, key, delay_ticks, 0)
    }

    /// Schedule a periodic timer firing every `period_ticks`.
    pub fn schedule_periodic(&self, kind: TimerKind, key: u32, period_ticks: u64) -> TimerToken {
        self.schedule_inner(kind, key, period_ticks.max(1), period_ticks.max(1))
    }

    fn schedule_inner(
        &self,
        kind: TimerKind,
        key: u32,
        delay_ticks: u64,
        period_ticks: u64,
    ) -> TimerToken {
        let token = TimerToken(TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock();
        let deadline = inner.current_tick + delay_ticks.max(1);
        let slot = (deadline % NUM_SLOTS as u64) as usize;
        inner.slots[slot].push(TimerEntry {
            deadline_tick: deadline,
            kind,
            key,
            token,
            period_ticks,
            cancelled: false,
        });
        token
    }

    /// Cancel a scheduled timer. Safe to call after it has fired.
    pub fn cancel(&self, token: TimerToken) -> bool {
        if token == TimerToken::INVALID {
            return false;
        }
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            for entry in slot.iter_mut() {
                if entry.token == token && !entry.cancelled {
                    entry.cancelled = true;
                    return true;
                }
            }
        }
        false
    }

    /// Advance the wheel to `now_tick`, collecting expired entries. The
    /// caller dispatches them with no lock held.
    pub fn advance_to(&self, now_tick: u64) -> Vec<Expired> {
        let mut fired = Vec::new();
        let mut inner = self.inner.lock();

        while inner.current_tick < now_tick && fired.len() < MAX_TIMERS_PER_TICK {
            inner.current_tick += 1;
            let tick = inner.current_tick;
            let slot_idx = (tick % NUM_SLOTS as u64) as usize;

            let mut reload: Vec<TimerEntry> = Vec::new();
            let slot = &mut inner.slots[slot_idx];
            let mut i = 0;
            while i < slot.len() {
                if slot[i].cancelled {
                    slot.swap_remove(i);
                    continue;
                }
                if slot[i].deadline_tick <= tick {
                    let entry = slot.swap_remove(i);
                    fired.push(Expired {
                        kind: entry.kind,
                        key: entry.key,
                        token: entry.token,
                    });
                    if entry.period_ticks > 0 {
                        reload.push(TimerEntry {
                            deadline_tick: tick + entry.period_ticks,
                            ..entry
                        });
                    }
                    if fired.len() >= MAX_TIMERS_PER_TICK {
                        break;
                    }
                    continue;
                }
                i += 1;
            }

            for entry in reload {
                let slot_idx = (entry.deadline_tick % NUM_SLOTS as u64) as usize;
                inner.slots[slot_idx].push(entry);
            }
        }

        fired
    }

    /// Pending (non-cancelled) entry count, for diagnostics.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .map(|s| s.iter().filter(|e| !e.cancelled).count())
            .sum()
    }

    /// Current wheel time.
    pub fn now(&self) -> u64 {
        self.inner.lock().current_tick
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}
