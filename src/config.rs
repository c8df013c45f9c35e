//! Engine configuration shared by the scheduler and the worker.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::mutater::{self, KindSet};

/// Default worker batch size. Mutant loaders pin memory for as long as their
/// classes are live, so batches are kept short and workers short-lived.
pub const DEFAULT_MAX_EXTERNAL_MUTATIONS: usize = 50;

/// Configuration for one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Classpath roots holding the target and its dependencies.
    pub classpath: Vec<PathBuf>,
    /// Harness command (program plus fixed arguments) driven by the
    /// test-runner façade.
    pub harness: Vec<String>,
    /// Arguments forwarded to the worker runtime.
    pub jvm_args: Vec<String>,
    /// `name=value` properties forwarded to the worker runtime.
    pub properties: Vec<String>,
    /// Enabled mutation kinds.
    pub kinds: KindSet,
    /// Method names never mutated.
    pub excluded_methods: BTreeSet<String>,
    /// Class-name prefixes the mutant loader delegates to its parent.
    pub deferred_prefixes: Vec<String>,
    /// First mutation index to run; earlier indices are skipped.
    pub first_mutation: usize,
    /// Worker batch size cap.
    pub max_external_mutations: usize,
    /// Directory of cache manifests.
    pub cache_dir: PathBuf,
    /// Read the cache at warm-up.
    pub load_cache: bool,
    /// Write the cache after warm-up and at end of run.
    pub save_cache: bool,
    /// Sort tests fastest-first and remember killers.
    pub order_tests: bool,
    /// Rewrite `Abstract*` targets to their `Dummy*` test double when
    /// deriving a default test class name.
    pub dummy_for_abstract: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cache_dir = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".jostle")
            .join("cache");
        Self {
            classpath: vec![PathBuf::from(".")],
            harness: Vec::new(),
            jvm_args: Vec::new(),
            properties: Vec::new(),
            kinds: KindSet::baseline(),
            excluded_methods: mutater::default_exclusions(),
            deferred_prefixes: default_deferred_prefixes(),
            first_mutation: 0,
            max_external_mutations: DEFAULT_MAX_EXTERNAL_MUTATIONS,
            cache_dir,
            load_cache: true,
            save_cache: true,
            order_tests: true,
            dummy_for_abstract: true,
        }
    }
}

/// Prefixes whose identity must be shared with the harness: the test
/// framework and the engine's own event types.
pub fn default_deferred_prefixes() -> Vec<String> {
    ["junit.", "org.junit.", "jostle."]
        .into_iter()
        .map(String::from)
        .collect()
}

impl EngineConfig {
    pub fn with_classpath(mut self, classpath: Vec<PathBuf>) -> Self {
        self.classpath = classpath;
        self
    }

    pub fn with_harness(mut self, harness: Vec<String>) -> Self {
        self.harness = harness;
        self
    }

    pub fn with_kinds(mut self, kinds: KindSet) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn with_first_mutation(mut self, first_mutation: usize) -> Self {
        self.first_mutation = first_mutation;
        self
    }

    pub fn with_max_external_mutations(mut self, cap: usize) -> Self {
        self.max_external_mutations = cap.max(1);
        self
    }

    pub fn exclude_methods(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.excluded_methods.extend(names);
        self
    }

    pub fn defer_prefixes(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
        self.deferred_prefixes.extend(prefixes);
        self
    }

    /// Derive the conventional test class for `target` when none is given:
    /// inner-class suffixes drop, an `Abstract` prefix becomes `Dummy`, and
    /// `Test` is appended.
    pub fn default_test_class(&self, target: &str) -> String {
        let base = target.split('$').next().unwrap_or(target);
        let (package, simple) = match base.rfind('.') {
            Some(dot) => (&base[..dot + 1], &base[dot + 1..]),
            None => ("", base),
        };
        let simple = if self.dummy_for_abstract {
            simple
                .strip_prefix("Abstract")
                .map(|rest| format!("Dummy{rest}"))
                .unwrap_or_else(|| simple.to_string())
        } else {
            simple.to_string()
        };
        format!("{package}{simple}Test")
    }
}
