//! Test result model and normalization rules
//!
//! This module defines the data shapes produced by one test run
//! (`TestSuite`, `TestCase`, `TestAssertion`) and the deterministic rules
//! for deriving them from the raw signals a test subprocess emits:
//! the structured side-channel report, the process exit code, and the
//! unittest summary text written to stderr.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Suite-level or case-level outcome of a test run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// All tests passed
    Passed,
    /// Tests ran but some failed
    Failed,
    /// System error in test execution
    Error,
    /// Run has not completed yet
    Pending,
    /// Test was skipped
    Skipped,
    /// Status string not recognized
    Unknown,
}

impl TestStatus {
    /// Parse a status string from the side-channel report (case-insensitive).
    /// Unrecognized values map to `Unknown` rather than failing the run.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "passed" => TestStatus::Passed,
            "failed" => TestStatus::Failed,
            "error" => TestStatus::Error,
            "pending" => TestStatus::Pending,
            "skipped" => TestStatus::Skipped,
            _ => TestStatus::Unknown,
        }
    }

    /// Derive a status from a process exit code when no richer signal is
    /// available. The wrapped unittest runner exits 0 on success and 1 when
    /// tests failed; anything else (including a missing code) is an error.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => TestStatus::Passed,
            Some(1) => TestStatus::Failed,
            _ => TestStatus::Error,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Error => "error",
            TestStatus::Pending => "pending",
            TestStatus::Skipped => "skipped",
            TestStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Aggregate counts for one test run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    /// Total tests executed
    pub tests_run: u32,
    /// Tests that passed
    pub passed: u32,
    /// Tests that failed
    pub failed: u32,
    /// Tests with errors
    pub errors: u32,
    /// Total execution time in milliseconds
    pub duration: f64,
}

/// One assertion recorded for a test case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestAssertion {
    pub passed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<serde_json::Value>,
    /// File and line number where the assertion failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// One test method's outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// Challenge function name ("challenge_01")
    pub member_id: String,
    /// Test name ("test_challenge_01")
    pub identity: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Time taken for this specific test in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assertions: Option<Vec<TestAssertion>>,
}

/// Aggregate result of one test run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    /// Full test path ("exercise_test.Testing.test_challenge_01")
    pub identity: String,
    /// The overall suite status
    pub status: TestStatus,
    /// Human-readable result message
    pub message: String,
    pub summary: TestSummary,
    /// Individual test cases; exactly one per run in this protocol version
    pub cases: Vec<TestCase>,
    /// Captured standard-output lines (the learner's own `print` output)
    pub output: Vec<String>,
}

impl TestSuite {
    /// Check the protocol invariant that one run produces exactly one case.
    /// Consumers must drop the suite instead of rendering partial data when
    /// this fails.
    pub fn check_protocol(&self) -> Result<(), ProtocolViolation> {
        if self.cases.len() != 1 {
            return Err(ProtocolViolation::CaseCount(self.cases.len()));
        }
        Ok(())
    }

    /// Synthesize a failure suite for errors that happen before any test
    /// output exists (spawn failure, timeout). Keeps the one-case invariant.
    pub fn failure(identity: &str, member_id: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        TestSuite {
            identity: identity.to_string(),
            status: TestStatus::Error,
            message: message.clone(),
            summary: TestSummary::default(),
            cases: vec![TestCase {
                member_id: member_id.to_string(),
                identity: identity.to_string(),
                status: TestStatus::Error,
                message: Some(message),
                duration: None,
                assertions: None,
            }],
            output: vec![],
        }
    }
}

/// Violation of the result protocol invariants
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtocolViolation {
    #[error("expected exactly 1 test case per suite, got {0}")]
    CaseCount(usize),
}

// Side-channel report
//--------------------------------------------------

/// The structured JSON document the test subprocess writes to the data pipe
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideChannelReport {
    pub was_successful: bool,
    pub summary: TestSummary,
    #[serde(default)]
    pub cases: Vec<SideChannelCase>,
}

/// Per-case entry in the side-channel report
#[derive(Debug, Clone, Deserialize)]
pub struct SideChannelCase {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub assertions: Option<Vec<TestAssertion>>,
}

// Stderr summary heuristics
//--------------------------------------------------
//
// The unittest text runner writes its summary to stderr by convention.
// These parsers are a compatibility shim for subprocesses that do not
// produce the structured side-channel report.

/// Parse a `"Ran 5 tests in 0.012s"` line into (tests_run, duration_ms).
pub fn parse_ran_line(line: &str) -> Option<(u32, Option<f64>)> {
    let rest = line.trim().strip_prefix("Ran ")?;
    let mut parts = rest.split_whitespace();
    let tests_run: u32 = parts.next()?.parse().ok()?;
    if !parts.next()?.starts_with("test") {
        return None;
    }

    let mut duration = None;
    if let (Some("in"), Some(value)) = (parts.next(), parts.next()) {
        if let Some(seconds) = value.strip_suffix('s') {
            duration = seconds.parse::<f64>().ok().map(|s| s * 1000.0);
        }
    }
    Some((tests_run, duration))
}

/// Parse a `"FAILED (failures=2, errors=1)"` line into (failures, errors).
/// Either count may be absent; absent means zero.
pub fn parse_failed_line(line: &str) -> Option<(u32, u32)> {
    let rest = line.trim().strip_prefix("FAILED")?;
    let rest = rest.trim().trim_start_matches('(').trim_end_matches(')');

    let mut failures = 0u32;
    let mut errors = 0u32;
    for token in rest.split(',') {
        let token = token.trim();
        if let Some(value) = token.strip_prefix("failures=") {
            failures = value.parse().ok()?;
        } else if let Some(value) = token.strip_prefix("errors=") {
            errors = value.parse().ok()?;
        }
    }
    Some((failures, errors))
}

impl TestSummary {
    /// Derive a summary from unittest stderr text. `passed` is whatever the
    /// run count leaves after failures and errors.
    pub fn from_stderr(stderr: &str) -> TestSummary {
        let mut summary = TestSummary::default();
        for line in stderr.lines() {
            if let Some((tests_run, duration)) = parse_ran_line(line) {
                summary.tests_run = tests_run;
                if let Some(ms) = duration {
                    summary.duration = ms;
                }
            } else if let Some((failures, errors)) = parse_failed_line(line) {
                summary.failed = failures;
                summary.errors = errors;
            }
        }
        summary.passed = summary
            .tests_run
            .saturating_sub(summary.failed + summary.errors);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_case_insensitive() {
        assert_eq!(TestStatus::parse("PASSED"), TestStatus::Passed);
        assert_eq!(TestStatus::parse("Failed"), TestStatus::Failed);
        assert_eq!(TestStatus::parse("error"), TestStatus::Error);
        assert_eq!(TestStatus::parse("skipped"), TestStatus::Skipped);
    }

    #[test]
    fn test_status_parse_unrecognized() {
        assert_eq!(TestStatus::parse("exploded"), TestStatus::Unknown);
        assert_eq!(TestStatus::parse(""), TestStatus::Unknown);
    }

    #[test]
    fn test_status_from_exit_code() {
        assert_eq!(TestStatus::from_exit_code(Some(0)), TestStatus::Passed);
        assert_eq!(TestStatus::from_exit_code(Some(1)), TestStatus::Failed);
        assert_eq!(TestStatus::from_exit_code(Some(2)), TestStatus::Error);
        assert_eq!(TestStatus::from_exit_code(None), TestStatus::Error);
    }

    #[test]
    fn test_parse_ran_line() {
        assert_eq!(
            parse_ran_line("Ran 5 tests in 0.012s"),
            Some((5, Some(12.0)))
        );
        assert_eq!(parse_ran_line("Ran 1 test in 0.001s"), Some((1, Some(1.0))));
        assert_eq!(parse_ran_line("OK"), None);
        assert_eq!(parse_ran_line("Ran x tests"), None);
    }

    #[test]
    fn test_parse_failed_line() {
        assert_eq!(
            parse_failed_line("FAILED (failures=2, errors=1)"),
            Some((2, 1))
        );
        assert_eq!(parse_failed_line("FAILED (failures=3)"), Some((3, 0)));
        assert_eq!(parse_failed_line("FAILED (errors=1)"), Some((0, 1)));
        assert_eq!(parse_failed_line("OK"), None);
    }

    #[test]
    fn test_summary_from_stderr_all_passed() {
        let stderr = "test_challenge_01 ... ok\n\nRan 5 tests in 0.012s\n\nOK\n";
        let summary = TestSummary::from_stderr(stderr);
        assert_eq!(summary.tests_run, 5);
        assert_eq!(summary.passed, 5);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.errors, 0);
    }

    #[test]
    fn test_summary_from_stderr_with_failures() {
        let stderr = "Ran 5 tests in 0.012s\n\nFAILED (failures=2, errors=1)\n";
        let summary = TestSummary::from_stderr(stderr);
        assert_eq!(summary.tests_run, 5);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.errors, 1);
    }

    #[test]
    fn test_suite_protocol_invariant() {
        let suite = TestSuite::failure("m.Testing.test_x", "x", "boom");
        assert!(suite.check_protocol().is_ok());

        let mut bad = suite.clone();
        bad.cases.clear();
        assert_eq!(bad.check_protocol(), Err(ProtocolViolation::CaseCount(0)));
    }

    #[test]
    fn test_failure_suite_shape() {
        let suite = TestSuite::failure("m.Testing.test_x", "x", "spawn failed: ENOENT");
        assert_eq!(suite.status, TestStatus::Error);
        assert_eq!(suite.cases.len(), 1);
        assert_eq!(suite.cases[0].member_id, "x");
        assert!(suite.message.contains("ENOENT"));
    }

    #[test]
    fn test_side_channel_report_decode() {
        let json = r#"{
            "wasSuccessful": true,
            "summary": {"testsRun": 1, "passed": 1, "failed": 0, "errors": 0, "duration": 12},
            "cases": [{"id": "t1", "status": "passed", "duration": 12}]
        }"#;
        let report: SideChannelReport = serde_json::from_str(json).unwrap();
        assert!(report.was_successful);
        assert_eq!(report.summary.tests_run, 1);
        assert_eq!(report.cases[0].id, "t1");
    }
}
