//! Test execution orchestration
//!
//! Composes the identity resolver and the process runner to run exactly one
//! challenge's tests, reconciling the two concurrent output channels
//! (buffered text and the structured fd-3 report) into one normalized
//! [`TestSuite`]. When the side-channel report is present it is
//! authoritative; otherwise the orchestrator falls back to the unittest
//! stderr heuristics and the process exit code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::identity::TestConvention;
use crate::python::{ProcessResult, Python, PythonOptions, SideChannel};
use crate::testing::{
    SideChannelReport, TestAssertion, TestCase, TestStatus, TestSuite, TestSummary,
};

/// Runs one challenge's tests and produces a normalized suite
#[async_trait]
pub trait TestLauncher: Send + Sync {
    /// Execute the tests for `member_id` against the given test file.
    ///
    /// An `Err` here means the subprocess could not be launched at all; the
    /// caller is responsible for converting that into a user-visible
    /// failure suite. Test failures are never errors.
    async fn execute(&self, test_file: &Path, member_id: &str) -> Result<TestSuite>;
}

/// The production launcher: external interpreter + unittest convention
pub struct PythonLauncher {
    python: Python,
    convention: TestConvention,
    timeout: Duration,
}

impl PythonLauncher {
    pub fn new(python: Python, convention: TestConvention, timeout: Duration) -> Self {
        Self {
            python,
            convention,
            timeout,
        }
    }
}

#[async_trait]
impl TestLauncher for PythonLauncher {
    async fn execute(&self, test_file: &Path, member_id: &str) -> Result<TestSuite> {
        let identity = self.convention.resolve(test_file, member_id);
        let module = self.convention.module_name(test_file);
        let work_dir = test_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let options = PythonOptions::new()
            .with_cwd(&work_dir)
            .with_python_path(&work_dir)
            .with_pipe_data(true);

        info!(member_id, identity = %identity, "Running challenge tests");

        // Spawn errors propagate: the session controller turns them into a
        // synthesized failure suite.
        let mut process = self.python.spawn(
            ["-m", module.as_str(), "client", "identity", identity.as_str()],
            &options,
        )?;
        let side = process.take_side_channel();

        // Both channels read from the same live child; awaiting them
        // sequentially can deadlock when the unread pipe's buffer fills.
        let joined = async { tokio::join!(process.monitor(), SideChannel::read_optional(side)) };

        let (result, report) = match tokio::time::timeout(self.timeout, joined).await {
            Ok(parts) => parts,
            Err(_) => {
                // Dropping the timed-out future drops the child handle,
                // which kills the process (kill_on_drop).
                warn!(member_id, "Test run exceeded deadline, child killed");
                return Ok(TestSuite::failure(
                    &identity,
                    member_id,
                    format!("Test run timed out after {:?}", self.timeout),
                ));
            }
        };
        let result = result?;

        Ok(assemble_suite(&identity, member_id, &result, report))
    }
}

/// Reconcile the raw process capture and the optional side-channel JSON
/// into one suite. A report that fails to decode is treated the same as no
/// report at all.
pub fn assemble_suite(
    identity: &str,
    member_id: &str,
    result: &ProcessResult,
    report: Option<serde_json::Value>,
) -> TestSuite {
    let report = report.and_then(|value| {
        match serde_json::from_value::<SideChannelReport>(value) {
            Ok(report) => Some(report),
            Err(error) => {
                warn!("Side-channel report did not match expected shape: {}", error);
                None
            }
        }
    });

    // The learner's own print output comes from stdout either way.
    let output = result.stdout_lines();

    match report {
        Some(report) => suite_from_report(identity, member_id, report, output),
        None => suite_from_process(identity, member_id, result, output),
    }
}

/// Structured path: the side-channel report is authoritative.
fn suite_from_report(
    identity: &str,
    member_id: &str,
    report: SideChannelReport,
    output: Vec<String>,
) -> TestSuite {
    let status = if report.was_successful {
        TestStatus::Passed
    } else if report.summary.errors > 0 {
        TestStatus::Error
    } else {
        TestStatus::Failed
    };

    // A run targets one challenge, so the report carries at most one case.
    let case = report.cases.into_iter().next();
    let case_status = case
        .as_ref()
        .map(|c| TestStatus::parse(&c.status))
        .unwrap_or(status);
    let case_message = case.as_ref().and_then(|c| c.message.clone());
    let message = case_message
        .clone()
        .unwrap_or_else(|| summary_message(&report.summary));

    TestSuite {
        identity: identity.to_string(),
        status,
        message,
        summary: report.summary,
        cases: vec![TestCase {
            member_id: member_id.to_string(),
            identity: identity.to_string(),
            status: case_status,
            message: case_message,
            duration: case.as_ref().and_then(|c| c.duration),
            assertions: case.and_then(|c| c.assertions),
        }],
        output,
    }
}

/// Fallback path for subprocesses without side-channel support: unittest
/// stderr heuristics plus the exit code.
fn suite_from_process(
    identity: &str,
    member_id: &str,
    result: &ProcessResult,
    output: Vec<String>,
) -> TestSuite {
    let stderr = result.stderr_text();
    let summary = TestSummary::from_stderr(&stderr);
    let status = TestStatus::from_exit_code(result.exit_code);
    let message = summary_message(&summary);

    let assertions = if status == TestStatus::Passed {
        None
    } else {
        let failing = failing_assertions(&stderr);
        (!failing.is_empty()).then_some(failing)
    };

    TestSuite {
        identity: identity.to_string(),
        status,
        message: message.clone(),
        summary,
        cases: vec![TestCase {
            member_id: member_id.to_string(),
            identity: identity.to_string(),
            status,
            message: Some(message),
            duration: None,
            assertions,
        }],
        output,
    }
}

fn summary_message(summary: &TestSummary) -> String {
    format!(
        "Ran {} test(s): {} passed, {} failed, {} errors",
        summary.tests_run, summary.passed, summary.failed, summary.errors
    )
}

/// Reinterpret unittest failure lines as failing assertions.
fn failing_assertions(stderr: &str) -> Vec<TestAssertion> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| {
            line.starts_with("FAIL:")
                || line.starts_with("ERROR:")
                || line.contains("AssertionError")
        })
        .map(|line| TestAssertion {
            passed: false,
            message: line.to_string(),
            expected: None,
            actual: None,
            location: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn process_result(exit_code: Option<i32>, stdout: &str, stderr: &str) -> ProcessResult {
        ProcessResult {
            process_id: Some(42),
            exit_code,
            errors: vec![stderr.to_string()],
            output: vec![stdout.to_string()],
        }
    }

    #[test]
    fn test_side_channel_report_is_authoritative() {
        let report = json!({
            "wasSuccessful": true,
            "summary": {"testsRun": 1, "passed": 1, "failed": 0, "errors": 0, "duration": 12},
            "cases": [{"id": "t1", "status": "passed", "duration": 12}]
        });
        // exit code disagrees on purpose; the report wins
        let result = process_result(Some(1), "hello from learner\n", "");

        let suite = assemble_suite("ex_test.Testing.test_c", "c", &result, Some(report));
        assert_eq!(suite.status, TestStatus::Passed);
        assert_eq!(suite.cases.len(), 1);
        assert_eq!(suite.cases[0].status, TestStatus::Passed);
        assert_eq!(suite.cases[0].member_id, "c");
        assert_eq!(suite.summary.tests_run, 1);
        assert_eq!(suite.output, vec!["hello from learner"]);
        assert!(suite.check_protocol().is_ok());
    }

    #[test]
    fn test_unrecognized_case_status_maps_to_unknown() {
        let report = json!({
            "wasSuccessful": false,
            "summary": {"testsRun": 1, "passed": 0, "failed": 1, "errors": 0, "duration": 3},
            "cases": [{"id": "t1", "status": "exploded"}]
        });
        let result = process_result(Some(1), "", "");

        let suite = assemble_suite("m.Testing.test_c", "c", &result, Some(report));
        assert_eq!(suite.status, TestStatus::Failed);
        assert_eq!(suite.cases[0].status, TestStatus::Unknown);
    }

    #[test]
    fn test_malformed_report_falls_back_to_stderr() {
        let report = json!({"unexpected": "shape"});
        let result = process_result(Some(0), "", "Ran 5 tests in 0.012s\n\nOK\n");

        let suite = assemble_suite("m.Testing.test_c", "c", &result, Some(report));
        assert_eq!(suite.status, TestStatus::Passed);
        assert_eq!(suite.summary.tests_run, 5);
        assert_eq!(suite.summary.passed, 5);
    }

    #[test]
    fn test_fallback_all_passed() {
        let result = process_result(Some(0), "", "Ran 5 tests in 0.012s\n\nOK\n");
        let suite = assemble_suite("m.Testing.test_c", "c", &result, None);

        assert_eq!(suite.status, TestStatus::Passed);
        assert_eq!(suite.summary.tests_run, 5);
        assert_eq!(suite.summary.passed, 5);
        assert_eq!(suite.summary.failed, 0);
        assert_eq!(suite.summary.errors, 0);
    }

    #[test]
    fn test_fallback_with_failures() {
        let stderr = "FAIL: test_c (m.Testing)\nAssertionError: 1 != 2\n\nRan 5 tests in 0.012s\n\nFAILED (failures=2, errors=1)\n";
        let result = process_result(Some(1), "", stderr);
        let suite = assemble_suite("m.Testing.test_c", "c", &result, None);

        assert_eq!(suite.status, TestStatus::Failed);
        assert_eq!(suite.summary.tests_run, 5);
        assert_eq!(suite.summary.passed, 2);
        assert_eq!(suite.summary.failed, 2);
        assert_eq!(suite.summary.errors, 1);

        let assertions = suite.cases[0].assertions.as_ref().unwrap();
        assert!(assertions.iter().all(|a| !a.passed));
        assert!(assertions.iter().any(|a| a.message.contains("AssertionError")));
    }

    #[test]
    fn test_fallback_exit_code_classification() {
        let none = assemble_suite("i", "c", &process_result(None, "", ""), None);
        assert_eq!(none.status, TestStatus::Error);

        let other = assemble_suite("i", "c", &process_result(Some(2), "", ""), None);
        assert_eq!(other.status, TestStatus::Error);
    }

    mod subprocess {
        use super::*;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable stub that stands in for the interpreter.
        fn stub_interpreter(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("python-stub");
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh\n{}", body).unwrap();
            let mut perms = file.metadata().unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        #[tokio::test]
        async fn test_execute_with_side_channel_stub() {
            let dir = tempfile::tempdir().unwrap();
            let stub = stub_interpreter(
                dir.path(),
                r#"printf '{"wasSuccessful": true, "summary": {"testsRun": 1, "passed": 1, "failed": 0, "errors": 0, "duration": 12}, "cases": [{"id": "t1", "status": "passed", "duration": 12}]}' >&3
echo learner output
exit 0"#,
            );

            let launcher = PythonLauncher::new(
                Python::new(stub.to_string_lossy().to_string()),
                TestConvention::default(),
                Duration::from_secs(10),
            );
            let test_file = dir.path().join("ex_test.py");
            std::fs::write(&test_file, "").unwrap();

            let suite = launcher.execute(&test_file, "challenge_01").await.unwrap();
            assert_eq!(suite.identity, "ex_test.Testing.test_challenge_01");
            assert_eq!(suite.status, TestStatus::Passed);
            assert_eq!(suite.output, vec!["learner output"]);
        }

        #[tokio::test]
        async fn test_execute_timeout_produces_error_suite() {
            let dir = tempfile::tempdir().unwrap();
            let stub = stub_interpreter(dir.path(), "sleep 30");

            let launcher = PythonLauncher::new(
                Python::new(stub.to_string_lossy().to_string()),
                TestConvention::default(),
                Duration::from_millis(200),
            );
            let test_file = dir.path().join("ex_test.py");
            std::fs::write(&test_file, "").unwrap();

            let suite = launcher.execute(&test_file, "challenge_01").await.unwrap();
            assert_eq!(suite.status, TestStatus::Error);
            assert!(suite.message.contains("timed out"));
        }

        #[tokio::test]
        async fn test_execute_spawn_failure_propagates() {
            let launcher = PythonLauncher::new(
                Python::new("/nonexistent/interpreter-for-tests"),
                TestConvention::default(),
                Duration::from_secs(1),
            );

            let result = launcher
                .execute(Path::new("/tmp/ex_test.py"), "challenge_01")
                .await;
            assert!(result.is_err());
        }
    }
}
