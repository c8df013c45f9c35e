//! Listener event vocabulary and the named listener registry.
//!
//! Listeners consume a fixed event stream (`Start`, `Mutation`, `Verdict`,
//! `End`) and render it to stdout; progress and diagnostics never go through
//! here. Listeners are selected by name from a registry of factory
//! functions, so front-ends can add formats without touching the scheduler.

use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};

/// Scheduler-level outcome of one mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutantOutcome {
    /// A test failed: the suite noticed the edit.
    Killed,
    /// Every test passed: a test-suite gap.
    Survived,
    /// The mutant ran over budget; counted as killed.
    Timeout,
    /// The engine could not score this index.
    EngineError,
}

impl MutantOutcome {
    /// Whether the outcome counts towards the killed total.
    pub fn counts_as_killed(self) -> bool {
        matches!(self, MutantOutcome::Killed | MutantOutcome::Timeout)
    }
}

/// Aggregated counts for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub total: usize,
    pub killed: usize,
    pub survived: usize,
    pub timeouts: usize,
    pub errors: usize,
}

impl Score {
    pub fn record(&mut self, outcome: MutantOutcome) {
        self.total += 1;
        match outcome {
            MutantOutcome::Killed => self.killed += 1,
            MutantOutcome::Survived => self.survived += 1,
            MutantOutcome::Timeout => self.timeouts += 1,
            MutantOutcome::EngineError => self.errors += 1,
        }
    }

    /// Mutation score in percent. Timeouts count as killed; mutants the
    /// engine failed to score are excluded from the denominator.
    pub fn percent(&self) -> f64 {
        let scored = self.total.saturating_sub(self.errors);
        if scored == 0 {
            return 100.0;
        }
        (self.killed + self.timeouts) as f64 * 100.0 / scored as f64
    }
}

/// The fixed event vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Start {
        target: String,
        points: usize,
    },
    Mutation {
        index: usize,
        method: String,
        line: Option<u32>,
        description: String,
    },
    Verdict {
        index: usize,
        outcome: MutantOutcome,
        killer: Option<String>,
    },
    End {
        score: Score,
    },
}

/// Event sink. Implementations own their output stream.
pub trait Listener {
    fn on_event(&mut self, event: &RunEvent);
}

#[derive(Debug, Clone, Default)]
struct MutationLabel {
    line: Option<u32>,
    description: String,
}

/// The default printer: one character per verdict, a final percentage.
pub struct DotListener<W: Write> {
    out: W,
    labels: BTreeMap<usize, MutationLabel>,
}

impl<W: Write> DotListener<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            labels: BTreeMap::new(),
        }
    }

    fn label(&mut self, index: usize) -> MutationLabel {
        self.labels.remove(&index).unwrap_or_default()
    }
}

impl<W: Write> Listener for DotListener<W> {
    fn on_event(&mut self, event: &RunEvent) {
        let result = match event {
            RunEvent::Start { target, points } => {
                writeln!(self.out, "Mutating {target} ({points} points)")
            }
            RunEvent::Mutation {
                index,
                line,
                description,
                ..
            } => {
                self.labels.insert(
                    *index,
                    MutationLabel {
                        line: *line,
                        description: description.clone(),
                    },
                );
                Ok(())
            }
            RunEvent::Verdict { index, outcome, .. } => {
                let label = self.label(*index);
                match outcome {
                    MutantOutcome::Killed => write!(self.out, "."),
                    MutantOutcome::Survived => writeln!(
                        self.out,
                        "\nM FAIL: {}: {}",
                        label.line.map_or_else(|| "?".to_string(), |l| l.to_string()),
                        label.description
                    ),
                    MutantOutcome::Timeout => writeln!(
                        self.out,
                        "\nT TIMEOUT: {}: {}",
                        label.line.map_or_else(|| "?".to_string(), |l| l.to_string()),
                        label.description
                    ),
                    MutantOutcome::EngineError => {
                        writeln!(self.out, "\nE ERROR at index {index}")
                    }
                }
            }
            RunEvent::End { score } => {
                writeln!(
                    self.out,
                    "\nScore: {:.0}% ({} killed, {} survived, {} timed out, {} errors, {} total)",
                    score.percent(),
                    score.killed,
                    score.survived,
                    score.timeouts,
                    score.errors,
                    score.total
                )
            }
        };
        // Listener output is best-effort: a closed pipe must not fail a run.
        let _ = result;
        let _ = self.out.flush();
    }
}

/// Emacs-compatible printer: `target:line: message` lines that compile-mode
/// can jump to.
pub struct EmacsListener<W: Write> {
    out: W,
    target: String,
    labels: BTreeMap<usize, MutationLabel>,
}

impl<W: Write> EmacsListener<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            target: String::new(),
            labels: BTreeMap::new(),
        }
    }
}

impl<W: Write> Listener for EmacsListener<W> {
    fn on_event(&mut self, event: &RunEvent) {
        let result = match event {
            RunEvent::Start { target, .. } => {
                self.target = target.clone();
                Ok(())
            }
            RunEvent::Mutation {
                index,
                line,
                description,
                ..
            } => {
                self.labels.insert(
                    *index,
                    MutationLabel {
                        line: *line,
                        description: description.clone(),
                    },
                );
                Ok(())
            }
            RunEvent::Verdict { index, outcome, .. } => {
                let label = self.labels.remove(index).unwrap_or_default();
                let line = label.line.unwrap_or(0);
                match outcome {
                    MutantOutcome::Survived => writeln!(
                        self.out,
                        "{}:{}: survived: {}",
                        self.target, line, label.description
                    ),
                    MutantOutcome::Timeout => writeln!(
                        self.out,
                        "{}:{}: timeout: {}",
                        self.target, line, label.description
                    ),
                    MutantOutcome::EngineError => {
                        writeln!(self.out, "{}:0: engine error at index {}", self.target, index)
                    }
                    MutantOutcome::Killed => Ok(()),
                }
            }
            RunEvent::End { score } => writeln!(
                self.out,
                "{}: score {:.0}% ({}/{})",
                self.target,
                score.percent(),
                score.killed + score.timeouts,
                score.total.saturating_sub(score.errors)
            ),
        };
        let _ = result;
        let _ = self.out.flush();
    }
}

type ListenerFactory = fn() -> Box<dyn Listener + Send>;

fn registry() -> BTreeMap<&'static str, ListenerFactory> {
    let mut map: BTreeMap<&'static str, ListenerFactory> = BTreeMap::new();
    map.insert("default", || Box::new(DotListener::new(io::stdout())));
    map.insert("emacs", || Box::new(EmacsListener::new(io::stdout())));
    map
}

/// Instantiate a listener by registry name.
pub fn create_listener(name: &str) -> Option<Box<dyn Listener + Send>> {
    registry().get(name).map(|factory| factory())
}

/// Registered listener names, for usage messages.
pub fn listener_names() -> Vec<&'static str> {
    registry().keys().copied().collect()
}
