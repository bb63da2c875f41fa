//! Timer wheel regression tests.
//!
//! These run against private wheel instances so they cannot disturb the
//! live stack timers.

use keel_lib::testing::TestResult;
use keel_lib::{assert_eq_test, assert_test, define_test_suite, pass};

use crate::timer::{TimerKind, TimerWheel};

pub fn test_single_shot_fires_once() -> TestResult {
    let wheel = TimerWheel::new();
    wheel.schedule(TimerKind::ArpFlush, 7, 10);

    assert_test!(wheel.advance_to(9).is_empty(), "not yet due");

    let fired = wheel.advance_to(10);
    assert_eq_test!(fired.len(), 1, "fires exactly at the deadline");
    assert_eq_test!(fired[0].kind, TimerKind::ArpFlush, "kind preserved");
    assert_eq_test!(fired[0].key, 7, "key preserved");

    assert_test!(wheel.advance_to(1000).is_empty(), "single-shot never repeats");
    pass!()
}

pub fn test_cancel_suppresses_firing() -> TestResult {
    let wheel = TimerWheel::new();
    let token = wheel.schedule(TimerKind::TcpRetransmit, 1, 5);
    assert_test!(wheel.cancel(token), "cancel finds the entry");
    assert_test!(wheel.advance_to(10).is_empty(), "cancelled timer is silent");
    assert_test!(!wheel.cancel(token), "double cancel reports nothing");
    pass!()
}

pub fn test_periodic_reloads() -> TestResult {
    let wheel = TimerWheel::new();
    wheel.schedule_periodic(TimerKind::ConntrackFlush, 3, 10);

    let mut total = 0;
    for step in 1..=5u64 {
        total += wheel.advance_to(step * 10).len();
    }
    assert_eq_test!(total, 5, "fires once per period");
    pass!()
}

pub fn test_long_delay_rides_rotations() -> TestResult {
    // A delay longer than the slot count must not fire early on the first
    // pass over its slot.
    let wheel = TimerWheel::new();
    wheel.schedule(TimerKind::PmtuAge, 1, 300);

    assert_test!(wheel.advance_to(256).is_empty(), "first rotation skips it");
    let mut fired = alloc::vec::Vec::new();
    let mut now = 256;
    while fired.is_empty() && now < 400 {
        now += 1;
        fired = wheel.advance_to(now);
    }
    assert_eq_test!(fired.len(), 1, "fires on the second rotation");
    assert_test!(now >= 300, "not before its deadline");
    pass!()
}

pub fn test_distinct_tokens() -> TestResult {
    let wheel = TimerWheel::new();
    let a = wheel.schedule(TimerKind::ArpFlush, 0, 5);
    let b = wheel.schedule(TimerKind::ArpFlush, 0, 5);
    assert_test!(a != b, "every schedule gets a fresh token");
    assert_eq_test!(wheel.pending(), 2, "both pending");
    wheel.cancel(a);
    assert_eq_test!(wheel.pending(), 1, "one left after cancel");
    pass!()
}

define_test_suite!(
    net_timer,
    [
        test_single_shot_fires_once,
        test_cancel_suppresses_firing,
        test_periodic_reloads,
        test_long_delay_rides_rotations,
        test_distinct_tokens,
    ]
);
