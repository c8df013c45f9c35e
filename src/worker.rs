//! Worker batch execution and the parent/worker line protocol.
//!
//! The worker process receives a plan, runs a contiguous range of mutation
//! indices, and reports exactly one verdict line per index on stdout,
//! terminated by `DONE`. Index `-1` selects warm-up mode, which runs every
//! test class unmutated and reports per-test timings instead.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::loader::{self, LoaderError, MutatingClassLoader};
use crate::mutater::{KindSet, MutateError, Mutater};
use crate::testrun::{HarnessError, TestId, TestRunner, TestVerdict};

/// Killer name reported when the mutated image fails structural
/// verification on load.
pub const VERIFIER_KILLER: &str = "verifier";

/// One test scheduled against each mutant, with its derived budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTest {
    pub test: TestId,
    pub budget_ms: u64,
}

/// Everything a worker needs for one batch, serialized to a handoff file by
/// the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPlan {
    pub classpath: Vec<PathBuf>,
    pub target: String,
    /// First mutation index; `-1` selects warm-up mode.
    pub first: i64,
    /// Number of consecutive indices to run (ignored in warm-up mode).
    pub count: usize,
    pub kinds: KindSet,
    pub excluded_methods: std::collections::BTreeSet<String>,
    pub deferred_prefixes: Vec<String>,
    pub harness: Vec<String>,
    pub jvm_args: Vec<String>,
    pub properties: Vec<String>,
    /// Test classes enumerated in warm-up mode.
    pub test_classes: Vec<String>,
    /// Ordered tests run against each mutant.
    pub tests: Vec<PlannedTest>,
    /// Killer memory: point index -> test to try first.
    pub killers: Vec<(usize, TestId)>,
}

/// Worker-fatal errors. Per-index problems become `ERR` verdicts instead.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("loader error: {0}")]
    Loader(#[from] LoaderError),
    #[error("plan file error: {0}")]
    Plan(#[from] serde_json::Error),
}

/// One line of the worker protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLine {
    /// Every test passed: the mutant survived.
    Pass { index: usize },
    /// A test failed: the mutant was killed.
    Fail { index: usize, killer: String },
    /// A test ran over budget: killed, benefit of the doubt.
    Timeout { index: usize },
    /// The harness misbehaved for this index.
    Err { index: usize, reason: String },
    /// The index was past the enumeration end.
    NoSuchPoint { index: usize },
    /// One warm-up test result.
    Warmup {
        test: TestId,
        passed: bool,
        elapsed_ms: u64,
        message: String,
    },
    /// Batch end sentinel.
    Done,
}

impl fmt::Display for WorkerLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerLine::Pass { index } => write!(f, "PASS {index}"),
            WorkerLine::Fail { index, killer } => write!(f, "FAIL {index} by {killer}"),
            WorkerLine::Timeout { index } => write!(f, "TIMEOUT {index}"),
            WorkerLine::Err { index, reason } => {
                write!(f, "ERR {index} {}", reason.replace('\n', " "))
            }
            WorkerLine::NoSuchPoint { index } => write!(f, "NOSUCHPOINT {index}"),
            WorkerLine::Warmup {
                test,
                passed,
                elapsed_ms,
                message,
            } => {
                if *passed {
                    write!(f, "WARMUP {test} PASS {elapsed_ms}")
                } else {
                    write!(f, "WARMUP {test} FAIL {elapsed_ms} {}", message.replace('\n', " "))
                }
            }
            WorkerLine::Done => write!(f, "DONE"),
        }
    }
}

impl FromStr for WorkerLine {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, String> {
        let bad = || format!("unparseable worker line: {line}");
        let mut parts = line.splitn(2, ' ');
        let head = parts.next().ok_or_else(bad)?;
        let rest = parts.next().unwrap_or("");
        match head {
            "DONE" => Ok(WorkerLine::Done),
            "PASS" => Ok(WorkerLine::Pass {
                index: rest.parse().map_err(|_| bad())?,
            }),
            "TIMEOUT" => Ok(WorkerLine::Timeout {
                index: rest.parse().map_err(|_| bad())?,
            }),
            "NOSUCHPOINT" => Ok(WorkerLine::NoSuchPoint {
                index: rest.parse().map_err(|_| bad())?,
            }),
            "FAIL" => {
                let (index, killer) = rest.split_once(" by ").ok_or_else(bad)?;
                Ok(WorkerLine::Fail {
                    index: index.parse().map_err(|_| bad())?,
                    killer: killer.to_string(),
                })
            }
            "ERR" => {
                let (index, reason) = match rest.split_once(' ') {
                    Some((index, reason)) => (index, reason),
                    None => (rest, ""),
                };
                Ok(WorkerLine::Err {
                    index: index.parse().map_err(|_| bad())?,
                    reason: reason.to_string(),
                })
            }
            "WARMUP" => {
                let mut fields = rest.splitn(3, ' ');
                let test = fields.next().ok_or_else(bad)?;
                let verdict = fields.next().ok_or_else(bad)?;
                let tail = fields.next().unwrap_or("");
                let (class, method) = test.split_once('#').ok_or_else(bad)?;
                let test = TestId {
                    class: class.to_string(),
                    method: method.to_string(),
                };
                match verdict {
                    "PASS" => Ok(WorkerLine::Warmup {
                        test,
                        passed: true,
                        elapsed_ms: tail.parse().map_err(|_| bad())?,
                        message: String::new(),
                    }),
                    "FAIL" => {
                        let (elapsed, message) = match tail.split_once(' ') {
                            Some((elapsed, message)) => (elapsed, message),
                            None => (tail, ""),
                        };
                        Ok(WorkerLine::Warmup {
                            test,
                            passed: false,
                            elapsed_ms: elapsed.parse().map_err(|_| bad())?,
                            message: message.to_string(),
                        })
                    }
                    _ => Err(bad()),
                }
            }
            _ => Err(bad()),
        }
    }
}

fn emit(out: &mut dyn Write, line: WorkerLine) -> Result<(), WorkerError> {
    writeln!(out, "{line}")?;
    out.flush()?;
    Ok(())
}

/// Execute a plan, writing protocol lines to `out`.
pub fn run_plan(
    plan: &WorkerPlan,
    runner: &dyn TestRunner,
    out: &mut dyn Write,
) -> Result<(), WorkerError> {
    if plan.first < 0 {
        run_warmup(plan, runner, out)?;
    } else {
        run_batch(plan, runner, out)?;
    }
    emit(out, WorkerLine::Done)
}

fn run_warmup(
    plan: &WorkerPlan,
    runner: &dyn TestRunner,
    out: &mut dyn Write,
) -> Result<(), WorkerError> {
    let classpath = loader::join_classpath(&plan.classpath);
    for class in &plan.test_classes {
        let results = match runner.run_class(&classpath, class, None) {
            Ok(results) => results,
            Err(err) => {
                // Surface an unrunnable test class as one failing pseudo-test
                // so the baseline check trips with a readable reason.
                emit(
                    out,
                    WorkerLine::Warmup {
                        test: TestId {
                            class: class.clone(),
                            method: "<harness>".to_string(),
                        },
                        passed: false,
                        elapsed_ms: 0,
                        message: err.to_string(),
                    },
                )?;
                continue;
            }
        };
        for result in results {
            let (passed, message) = match result.verdict {
                TestVerdict::Pass => (true, String::new()),
                TestVerdict::Fail { message } => (false, message),
                TestVerdict::Timeout => (false, "timed out".to_string()),
            };
            emit(
                out,
                WorkerLine::Warmup {
                    test: result.test,
                    passed,
                    elapsed_ms: result.elapsed.as_millis() as u64,
                    message,
                },
            )?;
        }
    }
    Ok(())
}

fn run_batch(
    plan: &WorkerPlan,
    runner: &dyn TestRunner,
    out: &mut dyn Write,
) -> Result<(), WorkerError> {
    let original = loader::find_class_bytes(&plan.classpath, &plan.target)?;
    let mutater = Mutater::new(plan.kinds, plan.excluded_methods.clone());
    let killers: BTreeMap<usize, TestId> = plan.killers.iter().cloned().collect();

    let first = plan.first as usize;
    for index in first..first + plan.count {
        let verdict = run_one(plan, runner, &mutater, &original, &killers, index);
        emit(out, verdict)?;
    }
    Ok(())
}

fn run_one(
    plan: &WorkerPlan,
    runner: &dyn TestRunner,
    mutater: &Mutater,
    original: &[u8],
    killers: &BTreeMap<usize, TestId>,
    index: usize,
) -> WorkerLine {
    let mutation = match mutater.mutate(original, index) {
        Ok(Some(mutation)) => mutation,
        Ok(None) => return WorkerLine::NoSuchPoint { index },
        Err(MutateError::ClassFile(err)) => {
            return WorkerLine::Err {
                index,
                reason: err.to_string(),
            }
        }
    };
    debug!(index, description = %mutation.description, "running mutant");

    // Force-load: a structurally invalid image counts as killed by the
    // runtime verifier.
    if crate::classfile::parse(&mutation.bytes).is_err() {
        return WorkerLine::Fail {
            index,
            killer: VERIFIER_KILLER.to_string(),
        };
    }

    let loader = MutatingClassLoader::new(
        plan.target.clone(),
        mutation.bytes,
        plan.deferred_prefixes.clone(),
        plan.classpath.clone(),
    );
    let overlay = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => {
            return WorkerLine::Err {
                index,
                reason: err.to_string(),
            }
        }
    };
    if let Err(err) = loader.materialize(overlay.path()) {
        return WorkerLine::Err {
            index,
            reason: err.to_string(),
        };
    }
    let mut roots = vec![overlay.path().to_path_buf()];
    roots.extend(plan.classpath.iter().cloned());
    let classpath = loader::join_classpath(&roots);

    for planned in ordered_tests(&plan.tests, killers.get(&index)) {
        let budget = Duration::from_millis(planned.budget_ms);
        match runner.run_test(&classpath, &planned.test, Some(budget)) {
            Ok(result) => match result.verdict {
                TestVerdict::Pass => continue,
                TestVerdict::Fail { .. } => {
                    return WorkerLine::Fail {
                        index,
                        killer: planned.test.to_string(),
                    }
                }
                TestVerdict::Timeout => return WorkerLine::Timeout { index },
            },
            Err(HarnessError::Abnormal { status }) => {
                return WorkerLine::Err {
                    index,
                    reason: format!("harness exited abnormally: {status}"),
                }
            }
            Err(err) => {
                return WorkerLine::Err {
                    index,
                    reason: err.to_string(),
                }
            }
        }
    }
    WorkerLine::Pass { index }
}

/// Plan order with the remembered killer for this point moved to the front.
fn ordered_tests<'a>(tests: &'a [PlannedTest], killer: Option<&TestId>) -> Vec<&'a PlannedTest> {
    let mut out = Vec::with_capacity(tests.len());
    if let Some(killer) = killer {
        if let Some(entry) = tests.iter().find(|planned| &planned.test == killer) {
            out.push(entry);
        }
    }
    for planned in tests {
        if out.first().map(|first| &first.test) != Some(&planned.test) {
            out.push(planned);
        }
    }
    out
}
