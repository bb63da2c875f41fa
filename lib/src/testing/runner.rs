use super::TestResult;

/// Run a single test function, logging its name and outcome.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    let result = test();
    match result {
        TestResult::Pass => crate::klog_debug!("  ok   {}", name),
        TestResult::Skipped => crate::klog_debug!("  skip {}", name),
        TestResult::Fail | TestResult::Panic => crate::klog_info!("  FAIL {}", name),
    }
    result
}
