//! Narrow façade over the host runtime's test harness.
//!
//! The engine never links the test framework; it drives a harness command
//! that runs one test class (or one test method) against a classpath and
//! reports one line per test. Everything the harness throws is reported as a
//! test failure, not an engine failure.

use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// One test, addressed as `class#method`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestId {
    pub class: String,
    pub method: String,
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.method)
    }
}

/// Outcome of one test execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestVerdict {
    Pass,
    Fail { message: String },
    Timeout,
}

/// One test's outcome with its elapsed wall time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub test: TestId,
    pub verdict: TestVerdict,
    pub elapsed: Duration,
}

/// Harness-level errors, distinct from test failures.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("no harness command configured")]
    NoCommand,
    #[error("failed to spawn harness: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("io error talking to harness: {0}")]
    Io(#[from] std::io::Error),
    #[error("harness protocol violation: {0}")]
    Protocol(String),
    #[error("harness exited abnormally ({status}) without reporting a failure")]
    Abnormal { status: String },
}

/// Runs tests against a loaded target established by the classpath.
pub trait TestRunner {
    /// Run every test method of `class`, in the framework's enumeration
    /// order, reporting per-test outcome and elapsed time.
    fn run_class(
        &self,
        classpath: &str,
        class: &str,
        budget: Option<Duration>,
    ) -> Result<Vec<TestResult>, HarnessError>;

    /// Run a single test method.
    fn run_test(
        &self,
        classpath: &str,
        test: &TestId,
        budget: Option<Duration>,
    ) -> Result<TestResult, HarnessError>;
}

/// Production adapter: spawns the configured host-runtime harness command.
#[derive(Debug, Clone)]
pub struct HostTestRunner {
    program: Vec<String>,
    jvm_args: Vec<String>,
    properties: Vec<String>,
}

impl HostTestRunner {
    pub fn new(program: Vec<String>, jvm_args: Vec<String>, properties: Vec<String>) -> Self {
        Self {
            program,
            jvm_args,
            properties,
        }
    }

    fn spawn_and_collect(
        &self,
        classpath: &str,
        class: &str,
        method: Option<&str>,
        budget: Option<Duration>,
    ) -> Result<(Vec<TestResult>, bool, String), HarnessError> {
        let (head, tail) = self.program.split_first().ok_or(HarnessError::NoCommand)?;
        let mut command = Command::new(head);
        command.args(tail);
        command.args(&self.jvm_args);
        for property in &self.properties {
            command.arg(format!("-D{property}"));
        }
        command.arg("-cp").arg(classpath).arg(class);
        if let Some(method) = method {
            command.arg(method);
        }

        // Output goes through temp files, not pipes: a filled pipe would
        // deadlock the wait loop below.
        let mut stdout_file = tempfile::tempfile()?;
        let stderr_file = tempfile::tempfile()?;
        command
            .stdin(Stdio::null())
            .stdout(stdout_file.try_clone()?)
            .stderr(stderr_file.try_clone()?);

        debug!(class, ?method, "spawning test harness");
        let mut child = command.spawn().map_err(HarnessError::Spawn)?;
        let start = Instant::now();
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(budget) = budget {
                if start.elapsed() > budget {
                    warn!(class, ?method, "harness exceeded budget, killing");
                    if let Err(err) = child.kill() {
                        debug!(%err, "kill after timeout failed (already gone?)");
                    }
                    timed_out = true;
                    break child.wait()?;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        };

        let mut stdout = String::new();
        stdout_file.seek(SeekFrom::Start(0))?;
        stdout_file.read_to_string(&mut stdout)?;

        let results = parse_harness_output(class, &stdout)?;
        if !timed_out && results.is_empty() && !status.success() {
            return Err(HarnessError::Abnormal {
                status: status.to_string(),
            });
        }
        Ok((results, timed_out, status.to_string()))
    }
}

impl TestRunner for HostTestRunner {
    fn run_class(
        &self,
        classpath: &str,
        class: &str,
        budget: Option<Duration>,
    ) -> Result<Vec<TestResult>, HarnessError> {
        let (mut results, timed_out, status) =
            self.spawn_and_collect(classpath, class, None, budget)?;
        if timed_out {
            results.push(TestResult {
                test: TestId {
                    class: class.to_string(),
                    method: "<budget>".to_string(),
                },
                verdict: TestVerdict::Timeout,
                elapsed: budget.unwrap_or_default(),
            });
        } else if results.is_empty() {
            return Err(HarnessError::Protocol(format!(
                "harness reported no tests for {class} (exit {status})"
            )));
        }
        Ok(results)
    }

    fn run_test(
        &self,
        classpath: &str,
        test: &TestId,
        budget: Option<Duration>,
    ) -> Result<TestResult, HarnessError> {
        let (results, timed_out, status) =
            self.spawn_and_collect(classpath, &test.class, Some(&test.method), budget)?;
        if timed_out {
            return Ok(TestResult {
                test: test.clone(),
                verdict: TestVerdict::Timeout,
                elapsed: budget.unwrap_or_default(),
            });
        }
        results
            .into_iter()
            .find(|result| result.test.method == test.method)
            .ok_or_else(|| {
                HarnessError::Protocol(format!(
                    "harness did not report {test} (exit {status})"
                ))
            })
    }
}

/// Parse `TEST <method> PASS|FAIL <ms> [message]` lines; anything else on
/// stdout is harness chatter and ignored.
fn parse_harness_output(class: &str, stdout: &str) -> Result<Vec<TestResult>, HarnessError> {
    let mut results = Vec::new();
    for line in stdout.lines() {
        let Some(rest) = line.strip_prefix("TEST ") else {
            continue;
        };
        let mut parts = rest.splitn(4, ' ');
        let method = parts
            .next()
            .ok_or_else(|| HarnessError::Protocol(line.to_string()))?;
        let verdict = parts
            .next()
            .ok_or_else(|| HarnessError::Protocol(line.to_string()))?;
        let millis: u64 = parts
            .next()
            .and_then(|ms| ms.parse().ok())
            .ok_or_else(|| HarnessError::Protocol(line.to_string()))?;
        let verdict = match verdict {
            "PASS" => TestVerdict::Pass,
            "FAIL" => TestVerdict::Fail {
                message: parts.next().unwrap_or("").to_string(),
            },
            _ => return Err(HarnessError::Protocol(line.to_string())),
        };
        results.push(TestResult {
            test: TestId {
                class: class.to_string(),
                method: method.to_string(),
            },
            verdict,
            elapsed: Duration::from_millis(millis),
        });
    }
    Ok(results)
}
