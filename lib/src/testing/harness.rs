// Test harness types: TestSuiteResult, TestSuiteDesc, TestRunSummary.
// Suites are auto-registered via #[link_section = "test_registry"] in
// define_test_suite!; the section's linker-provided start/stop symbols make
// the registry walkable without a registration call.

use core::ffi::{c_char, c_int};
use core::ptr;

/// Maximum number of test suites that can be registered.
pub const HARNESS_MAX_SUITES: usize = 64;

/// Default cycles per millisecond estimate (3 GHz).
const DEFAULT_CYCLES_PER_MS: u64 = 3_000_000;

/// Result of executing a single test suite.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TestSuiteResult {
    pub name: *const c_char,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub elapsed_ms: u32,
}

impl Default for TestSuiteResult {
    fn default() -> Self {
        Self {
            name: ptr::null(),
            total: 0,
            passed: 0,
            failed: 0,
            elapsed_ms: 0,
        }
    }
}

impl TestSuiteResult {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

pub type SuiteRunnerFn = fn(*mut TestSuiteResult) -> i32;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TestSuiteDesc {
    pub name: *const c_char,
    pub run: Option<SuiteRunnerFn>,
}

// SAFETY: TestSuiteDesc contains only pointers to static data and function
// pointers, read-only after link time.
unsafe impl Sync for TestSuiteDesc {}

/// Aggregated results from running all test suites.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TestRunSummary {
    pub suites: [TestSuiteResult; HARNESS_MAX_SUITES],
    pub suite_count: usize,
    pub total_tests: u32,
    pub passed: u32,
    pub failed: u32,
    pub elapsed_ms: u32,
}

impl Default for TestRunSummary {
    fn default() -> Self {
        Self {
            suites: [TestSuiteResult::default(); HARNESS_MAX_SUITES],
            suite_count: 0,
            total_tests: 0,
            passed: 0,
            failed: 0,
            elapsed_ms: 0,
        }
    }
}

/// Convert a TSC delta to milliseconds using the default frequency estimate.
pub fn measure_elapsed_ms(start: u64, end: u64) -> u32 {
    (end.saturating_sub(start) / DEFAULT_CYCLES_PER_MS) as u32
}

unsafe extern "Rust" {
    static __start_test_registry: TestSuiteDesc;
    static __stop_test_registry: TestSuiteDesc;
}

/// All suites registered through `define_test_suite!`, in link order.
pub fn registered_suites() -> &'static [TestSuiteDesc] {
    unsafe {
        let start = &__start_test_registry as *const TestSuiteDesc;
        let stop = &__stop_test_registry as *const TestSuiteDesc;
        let count = stop.offset_from(start) as usize;
        core::slice::from_raw_parts(start, count)
    }
}

/// Run every registered suite, logging a summary line per suite.
pub fn run_all_suites() -> TestRunSummary {
    let mut summary = TestRunSummary::default();
    for desc in registered_suites() {
        if summary.suite_count >= HARNESS_MAX_SUITES {
            break;
        }
        let Some(runner) = desc.run else { continue };
        let mut result = TestSuiteResult::default();
        let rc: c_int = runner(&mut result);
        summary.suites[summary.suite_count] = result;
        summary.suite_count += 1;
        summary.total_tests += result.total;
        summary.passed += result.passed;
        summary.failed += result.failed;
        summary.elapsed_ms += result.elapsed_ms;
        let name = unsafe { cstr_to_str(result.name) };
        crate::klog_info!(
            "suite {}: {}/{} passed in {} ms (rc={})",
            name,
            result.passed,
            result.total,
            result.elapsed_ms,
            rc
        );
    }
    crate::klog_info!(
        "tests: {}/{} passed across {} suites",
        summary.passed,
        summary.total_tests,
        summary.suite_count
    );
    summary
}

unsafe fn cstr_to_str(ptr: *const c_char) -> &'static str {
    if ptr.is_null() {
        return "<unnamed>";
    }
    let mut len = 0usize;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    let bytes = core::slice::from_raw_parts(ptr as *const u8, len);
    core::str::from_utf8(bytes).unwrap_or("<bad-utf8>")
}
