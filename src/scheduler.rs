//! The Fast Runner: top-level state machine driving worker processes.
//!
//! One target run walks `Init -> Counting -> WarmUp -> Looping -> Done`.
//! Mutants execute in an external worker so each batch starts from fresh
//! static state; the parent stays single-threaded and blocks only on worker
//! output and worker exit. Verdicts arrive in index order and carry their
//! index anyway, so a lying worker is caught instead of mis-scored.

use std::io::{BufRead, BufReader, Write};
use std::ops::Range;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{self, CacheStore, RunManifest};
use crate::config::EngineConfig;
use crate::listener::{Listener, MutantOutcome, RunEvent, Score};
use crate::loader::{self, LoaderError};
use crate::mutater::{MutateError, Mutater, PointInfo};
use crate::order::{per_test_budget, TestOrder, TimedTest};
use crate::testrun::TestId;
use crate::worker::{PlannedTest, WorkerLine, WorkerPlan, VERIFIER_KILLER};

/// Environment variable naming the worker executable, overriding the
/// default sibling-binary lookup. The e2e tests lean on this.
pub const WORKER_BIN_ENV: &str = "JOSTLE_WORKER";

/// Consecutive abnormal worker exits tolerated for one index before it is
/// written off as an engine error.
const MAX_STRIKES: usize = 3;

/// Grace period between the polite and the forceful kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Scheduler-level errors; all exit the run.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("loader error: {0}")]
    Loader(#[from] LoaderError),
    #[error("mutater error: {0}")]
    Mutate(#[from] MutateError),
    #[error("cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("plan serialization failed: {0}")]
    Plan(#[from] serde_json::Error),
    #[error("baseline test {test} failed: {message}")]
    Baseline { test: String, message: String },
    #[error("warm-up produced no tests to run")]
    NoTests,
    #[error("worker failure: {0}")]
    Worker(String),
    #[error("signal handler installation failed: {0}")]
    Signal(String),
}

/// One scored mutant.
#[derive(Debug, Clone)]
pub struct MutantVerdict {
    pub index: usize,
    pub outcome: MutantOutcome,
    pub killer: Option<String>,
    pub description: String,
}

/// The product of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub target: String,
    pub points: usize,
    pub score: Score,
    pub verdicts: Vec<MutantVerdict>,
    pub interrupted: bool,
}

fn install_interrupt_handler() -> Result<(), SchedulerError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    let result = INIT.get_or_init(|| {
        ctrlc::set_handler(|| {
            INTERRUPTED.store(true, Ordering::SeqCst);
        })
        .map_err(|err| err.to_string())
    });
    match result {
        Ok(()) => Ok(()),
        Err(message) => Err(SchedulerError::Signal(message.clone())),
    }
}

/// Why a batch stopped yielding verdicts.
#[derive(Debug, PartialEq, Eq)]
enum DrainEnd {
    /// `DONE` arrived after every expected verdict.
    Completed,
    /// The stream ended (worker death) or `DONE` came early.
    Died,
    /// No verdict arrived within the per-mutant budget.
    TimedOut,
    /// The worker reported an index out of sequence.
    Mismatch,
}

struct BatchDrain {
    verdicts: Vec<WorkerLine>,
    end: DrainEnd,
}

/// Read verdicts for `range` off the worker's line channel. Verdicts must
/// arrive in index order; each gets at most `budget` of wall time.
fn drain_batch(
    receiver: &Receiver<String>,
    range: Range<usize>,
    budget: Option<Duration>,
) -> BatchDrain {
    let mut verdicts = Vec::new();
    let mut expected = range.start;
    loop {
        if expected >= range.end {
            // Only the sentinel is left.
            return match receive(receiver, budget) {
                Received::Line(Ok(WorkerLine::Done)) => BatchDrain {
                    verdicts,
                    end: DrainEnd::Completed,
                },
                _ => BatchDrain {
                    verdicts,
                    end: DrainEnd::Died,
                },
            };
        }
        match receive(receiver, budget) {
            Received::Line(Ok(line)) => {
                let index = match &line {
                    WorkerLine::Pass { index }
                    | WorkerLine::Fail { index, .. }
                    | WorkerLine::Timeout { index }
                    | WorkerLine::Err { index, .. }
                    | WorkerLine::NoSuchPoint { index } => Some(*index),
                    WorkerLine::Done => None,
                    WorkerLine::Warmup { .. } => {
                        warn!("warm-up line during mutant batch");
                        return BatchDrain {
                            verdicts,
                            end: DrainEnd::Mismatch,
                        };
                    }
                };
                match index {
                    Some(index) if index == expected => {
                        verdicts.push(line);
                        expected += 1;
                    }
                    Some(index) => {
                        warn!(index, expected, "worker verdict out of sequence");
                        return BatchDrain {
                            verdicts,
                            end: DrainEnd::Mismatch,
                        };
                    }
                    None => {
                        return BatchDrain {
                            verdicts,
                            end: DrainEnd::Died,
                        }
                    }
                }
            }
            Received::Line(Err(message)) => {
                warn!(%message, "unparseable worker line");
                return BatchDrain {
                    verdicts,
                    end: DrainEnd::Mismatch,
                };
            }
            Received::Timeout => {
                return BatchDrain {
                    verdicts,
                    end: DrainEnd::TimedOut,
                }
            }
            Received::Closed => {
                return BatchDrain {
                    verdicts,
                    end: DrainEnd::Died,
                }
            }
        }
    }
}

enum Received {
    Line(Result<WorkerLine, String>),
    /// The budget elapsed with no line.
    Timeout,
    /// The worker closed its stdout.
    Closed,
}

fn receive(receiver: &Receiver<String>, budget: Option<Duration>) -> Received {
    let line = match budget {
        Some(budget) => match receiver.recv_timeout(budget) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => return Received::Timeout,
            Err(RecvTimeoutError::Disconnected) => return Received::Closed,
        },
        None => match receiver.recv() {
            Ok(line) => line,
            Err(_) => return Received::Closed,
        },
    };
    Received::Line(line.parse::<WorkerLine>())
}

struct WorkerHandle {
    child: Child,
    receiver: Receiver<String>,
    reader: Option<std::thread::JoinHandle<()>>,
    // Held so the plan file outlives the worker.
    _plan_file: tempfile::NamedTempFile,
}

impl WorkerHandle {
    /// SIGTERM, a grace period, then SIGKILL.
    fn terminate(&mut self) {
        #[cfg(unix)]
        {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(self.child.id().to_string())
                .status();
            let deadline = std::time::Instant::now() + KILL_GRACE;
            while std::time::Instant::now() < deadline {
                if matches!(self.child.try_wait(), Ok(Some(_))) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        if let Err(err) = self.child.kill() {
            debug!(%err, "worker kill failed (already exited?)");
        }
    }

    fn reap(mut self) {
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn worker_binary() -> PathBuf {
    if let Some(path) = std::env::var_os(WORKER_BIN_ENV) {
        return PathBuf::from(path);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| Some(exe.parent()?.join("jostle-worker")))
        .unwrap_or_else(|| PathBuf::from("jostle-worker"))
}

/// Scheduler for one target class.
pub struct FastRunner {
    config: EngineConfig,
    listener: Box<dyn Listener + Send>,
}

impl FastRunner {
    pub fn new(config: EngineConfig, listener: Box<dyn Listener + Send>) -> Self {
        Self { config, listener }
    }

    /// Run the full state machine for `target` against `test_classes`.
    pub fn run(
        &mut self,
        target: &str,
        test_classes: &[String],
    ) -> Result<RunReport, SchedulerError> {
        install_interrupt_handler()?;
        INTERRUPTED.store(false, Ordering::SeqCst);

        // Init + Counting.
        let target_bytes = loader::find_class_bytes(&self.config.classpath, target)?;
        let mutater = Mutater::new(self.config.kinds, self.config.excluded_methods.clone());
        let points = mutater.describe_points(&target_bytes)?;
        info!(target, points = points.len(), "counted mutation points");
        self.listener.on_event(&RunEvent::Start {
            target: target.to_string(),
            points: points.len(),
        });

        if points.is_empty() {
            // Nothing to mutate; a green suite scores 100% by definition.
            let score = Score::default();
            self.listener.on_event(&RunEvent::End { score });
            return Ok(RunReport {
                target: target.to_string(),
                points: 0,
                score,
                verdicts: Vec::new(),
                interrupted: false,
            });
        }

        // WarmUp, possibly skipped via the cache.
        let target_fingerprint = cache::fingerprint(&target_bytes);
        let list_fingerprint = self.test_list_fingerprint(test_classes);
        let store = CacheStore::new(&self.config.cache_dir);
        let cached = if self.config.load_cache {
            store.load(&target_fingerprint, &list_fingerprint)
        } else {
            None
        };
        let mut order = match cached {
            Some(manifest) => {
                info!(target, "warm-up skipped, cache manifest matched");
                manifest.to_order()
            }
            None => {
                let order = self.warm_up(target, test_classes)?;
                if self.config.save_cache {
                    store.save(&RunManifest::new(
                        target_fingerprint.clone(),
                        list_fingerprint.clone(),
                        &order,
                    ))?;
                }
                order
            }
        };
        if order.is_empty() {
            return Err(SchedulerError::NoTests);
        }

        // Looping.
        let report = self.run_loop(target, &points, &mut order)?;

        // Done: persist killer memory gathered during the loop.
        if self.config.save_cache {
            store.save(&RunManifest::new(
                target_fingerprint,
                list_fingerprint,
                &order,
            ))?;
        }
        self.listener.on_event(&RunEvent::End { score: report.score });
        Ok(report)
    }

    fn test_list_fingerprint(&self, test_classes: &[String]) -> String {
        let fingerprints: Vec<String> = test_classes
            .iter()
            .map(|class| {
                match loader::find_class_bytes(&self.config.classpath, class) {
                    Ok(bytes) => cache::fingerprint(&bytes),
                    Err(_) => {
                        // The harness may still find it; the name is then the
                        // best stable stand-in for invalidation.
                        debug!(class, "test class not on classpath, hashing its name");
                        cache::fingerprint(class.as_bytes())
                    }
                }
            })
            .collect();
        cache::test_list_fingerprint(&fingerprints)
    }

    fn base_plan(&self, target: &str, test_classes: &[String]) -> WorkerPlan {
        WorkerPlan {
            classpath: self.config.classpath.clone(),
            target: target.to_string(),
            first: -1,
            count: 0,
            kinds: self.config.kinds,
            excluded_methods: self.config.excluded_methods.clone(),
            deferred_prefixes: self.config.deferred_prefixes.clone(),
            harness: self.config.harness.clone(),
            jvm_args: self.config.jvm_args.clone(),
            properties: self.config.properties.clone(),
            test_classes: test_classes.to_vec(),
            tests: Vec::new(),
            killers: Vec::new(),
        }
    }

    fn batch_plan(
        &self,
        target: &str,
        order: &TestOrder,
        range: &Range<usize>,
    ) -> WorkerPlan {
        let mut plan = self.base_plan(target, &[]);
        plan.first = range.start as i64;
        plan.count = range.len();
        plan.tests = order
            .entries()
            .iter()
            .map(|entry| PlannedTest {
                test: entry.test.clone(),
                budget_ms: per_test_budget(entry.warmup).as_millis() as u64,
            })
            .collect();
        plan.killers = order
            .killers()
            .iter()
            .map(|(point, test)| (*point, test.clone()))
            .collect();
        plan
    }

    fn spawn_worker(&self, plan: &WorkerPlan) -> Result<WorkerHandle, SchedulerError> {
        let mut plan_file = tempfile::NamedTempFile::new()?;
        plan_file.write_all(&serde_json::to_vec(plan)?)?;
        plan_file.flush()?;

        let binary = worker_binary();
        debug!(binary = %binary.display(), first = plan.first, count = plan.count, "spawning worker");
        let mut child = Command::new(&binary)
            .arg("--plan")
            .arg(plan_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                SchedulerError::Worker(format!("failed to spawn {}: {err}", binary.display()))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::Worker("worker stdout unavailable".to_string()))?;
        let (sender, receiver) = crossbeam_channel::unbounded();
        let reader = std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if sender.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(WorkerHandle {
            child,
            receiver,
            reader: Some(reader),
            _plan_file: plan_file,
        })
    }

    /// One worker run with index -1: measure every test against the
    /// unmutated target. Any failure aborts the run; mutation scores are
    /// only meaningful on a green baseline.
    fn warm_up(
        &mut self,
        target: &str,
        test_classes: &[String],
    ) -> Result<TestOrder, SchedulerError> {
        info!(target, "warm-up: timing tests against the unmutated class");
        let plan = self.base_plan(target, test_classes);
        let mut handle = self.spawn_worker(&plan)?;

        let mut entries: Vec<TimedTest> = Vec::new();
        let mut failure: Option<(String, String)> = None;
        let mut finished = false;
        loop {
            let parsed = match receive(&handle.receiver, None) {
                Received::Line(parsed) => parsed,
                Received::Timeout | Received::Closed => break,
            };
            match parsed {
                Ok(WorkerLine::Warmup {
                    test,
                    passed,
                    elapsed_ms,
                    message,
                }) => {
                    if passed {
                        entries.push(TimedTest {
                            test,
                            warmup: Duration::from_millis(elapsed_ms),
                        });
                    } else if failure.is_none() {
                        failure = Some((test.to_string(), message));
                    }
                }
                Ok(WorkerLine::Done) => {
                    finished = true;
                    break;
                }
                Ok(other) => {
                    handle.terminate();
                    handle.reap();
                    return Err(SchedulerError::Worker(format!(
                        "unexpected line during warm-up: {other}"
                    )));
                }
                Err(message) => {
                    handle.terminate();
                    handle.reap();
                    return Err(SchedulerError::Worker(message));
                }
            }
        }
        handle.reap();

        if let Some((test, message)) = failure {
            return Err(SchedulerError::Baseline { test, message });
        }
        if !finished {
            return Err(SchedulerError::Worker(
                "worker died during warm-up".to_string(),
            ));
        }
        Ok(TestOrder::from_warmup(entries, self.config.order_tests))
    }

    fn run_loop(
        &mut self,
        target: &str,
        points: &[PointInfo],
        order: &mut TestOrder,
    ) -> Result<RunReport, SchedulerError> {
        let mut score = Score::default();
        let mut verdicts = Vec::new();
        let mut next = self.config.first_mutation.min(points.len());
        let mut announced = next;
        let mut strikes = 0usize;
        let mut interrupted = false;
        let budget = order.mutant_budget();

        while next < points.len() {
            if INTERRUPTED.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }
            let end = (next + self.config.max_external_mutations).min(points.len());
            for point in &points[announced.max(next)..end] {
                self.listener.on_event(&RunEvent::Mutation {
                    index: point.index,
                    method: point.method.clone(),
                    line: point.line,
                    description: point.description.clone(),
                });
            }
            announced = announced.max(end);

            let range = next..end;
            let plan = self.batch_plan(target, order, &range);
            let mut handle = self.spawn_worker(&plan)?;
            let drain = drain_batch(&handle.receiver, range, Some(budget));

            for line in drain.verdicts {
                let (outcome, killer) = match line {
                    WorkerLine::Pass { .. } => (MutantOutcome::Survived, None),
                    WorkerLine::Fail { killer, .. } => (MutantOutcome::Killed, Some(killer)),
                    WorkerLine::Timeout { .. } => (MutantOutcome::Timeout, None),
                    WorkerLine::Err { reason, index } => {
                        warn!(index, %reason, "worker reported an error verdict");
                        (MutantOutcome::EngineError, None)
                    }
                    WorkerLine::NoSuchPoint { index } => {
                        warn!(index, "worker saw no such point; enumeration drift");
                        (MutantOutcome::EngineError, None)
                    }
                    WorkerLine::Done | WorkerLine::Warmup { .. } => unreachable!("filtered in drain"),
                };
                if let (MutantOutcome::Killed, Some(killer)) = (outcome, &killer) {
                    if let Some((class, method)) = killer.split_once('#') {
                        order.note_kill(
                            next,
                            TestId {
                                class: class.to_string(),
                                method: method.to_string(),
                            },
                        );
                    } else if killer != VERIFIER_KILLER {
                        debug!(killer, "unparseable killer name, not cached");
                    }
                }
                self.record(
                    &mut score,
                    &mut verdicts,
                    points,
                    next,
                    outcome,
                    killer,
                );
                next += 1;
                strikes = 0;
            }

            match drain.end {
                DrainEnd::Completed => {}
                DrainEnd::TimedOut => {
                    warn!(index = next, "mutant budget exceeded, replacing worker");
                    handle.terminate();
                    self.record(
                        &mut score,
                        &mut verdicts,
                        points,
                        next,
                        MutantOutcome::Timeout,
                        None,
                    );
                    next += 1;
                    strikes = 0;
                }
                DrainEnd::Died | DrainEnd::Mismatch => {
                    handle.terminate();
                    if next < points.len() {
                        strikes += 1;
                        warn!(index = next, strikes, "worker lost mid-batch, requeueing");
                        if strikes >= MAX_STRIKES {
                            self.record(
                                &mut score,
                                &mut verdicts,
                                points,
                                next,
                                MutantOutcome::EngineError,
                                None,
                            );
                            next += 1;
                            strikes = 0;
                        }
                    }
                }
            }
            handle.reap();
        }

        Ok(RunReport {
            target: target.to_string(),
            points: points.len(),
            score,
            verdicts,
            interrupted,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        score: &mut Score,
        verdicts: &mut Vec<MutantVerdict>,
        points: &[PointInfo],
        index: usize,
        outcome: MutantOutcome,
        killer: Option<String>,
    ) {
        score.record(outcome);
        self.listener.on_event(&RunEvent::Verdict {
            index,
            outcome,
            killer: killer.clone(),
        });
        verdicts.push(MutantVerdict {
            index,
            outcome,
            killer,
            description: points
                .get(index)
                .map(|point| point.description.clone())
                .unwrap_or_default(),
        });
    }
}
