//! Warm-up timing and greedy test ordering.
//!
//! Fast tests run first, and the test that killed the previous mutant at a
//! point is tried first on the next mutant at the same point. Both are
//! heuristics: sorting by time minimises expected detection latency, and
//! killers are strongly local to their mutation point.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::testrun::TestId;

/// Flat per-test slack added on top of the proportional budget.
const BUDGET_SLACK: Duration = Duration::from_secs(2);

/// Per-test budget derived from the warm-up time: `10 * t + 2s`.
pub fn per_test_budget(warmup: Duration) -> Duration {
    warmup.saturating_mul(10) + BUDGET_SLACK
}

/// One test with its warm-up time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedTest {
    pub test: TestId,
    pub warmup: Duration,
}

/// The order tests are tried against each mutant.
///
/// Always a permutation of the warm-up tests: ordering policies reorder, they
/// never add or drop entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOrder {
    entries: Vec<TimedTest>,
    killers: BTreeMap<usize, TestId>,
}

impl TestOrder {
    /// Build from warm-up measurements. With `sort` the fastest test comes
    /// first; without it the warm-up enumeration order is kept.
    pub fn from_warmup(mut entries: Vec<TimedTest>, sort: bool) -> Self {
        if sort {
            entries.sort_by_key(|entry| entry.warmup);
        }
        Self {
            entries,
            killers: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[TimedTest] {
        &self.entries
    }

    /// Total warm-up time across all tests.
    pub fn total_warmup(&self) -> Duration {
        self.entries.iter().map(|entry| entry.warmup).sum()
    }

    /// Whole-mutant budget: 1.5x the sum of the per-test budgets.
    pub fn mutant_budget(&self) -> Duration {
        let total: Duration = self
            .entries
            .iter()
            .map(|entry| per_test_budget(entry.warmup))
            .sum();
        total + total / 2
    }

    /// Tests in execution order for a mutant at `point`: the remembered
    /// killer (if any) first, then the rest in timed order.
    pub fn tests_for_point(&self, point: usize) -> Vec<TimedTest> {
        let mut out = Vec::with_capacity(self.entries.len());
        if let Some(killer) = self.killers.get(&point) {
            if let Some(entry) = self.entries.iter().find(|entry| &entry.test == killer) {
                out.push(entry.clone());
            }
        }
        for entry in &self.entries {
            if out.first().map(|first| &first.test) != Some(&entry.test) {
                out.push(entry.clone());
            }
        }
        out
    }

    /// Remember the test that killed the mutant at `point`.
    pub fn note_kill(&mut self, point: usize, killer: TestId) {
        self.killers.insert(point, killer);
    }

    pub fn killers(&self) -> &BTreeMap<usize, TestId> {
        &self.killers
    }

    pub fn set_killers(&mut self, killers: BTreeMap<usize, TestId>) {
        self.killers = killers;
    }
}
