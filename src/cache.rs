//! On-disk run manifests keyed by target content hash.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::order::{TestOrder, TimedTest};
use crate::testrun::TestId;

/// Manifest layout version; bump on any incompatible change.
pub const MANIFEST_VERSION: u32 = 1;

/// Cache-level errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("atomic rename failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// SHA-256 content hash, hex encoded.
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Fingerprint of a test-class list: the hash of the concatenated per-class
/// fingerprints, so any change to any test class invalidates the entry.
pub fn test_list_fingerprint(class_fingerprints: &[String]) -> String {
    fingerprint(class_fingerprints.concat().as_bytes())
}

/// Persisted record of one target's warm-up timings and killer memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub version: u32,
    pub target_fingerprint: String,
    pub test_list_fingerprint: String,
    pub total_warmup_ms: u64,
    pub tests: Vec<TimedTestRecord>,
    pub killers: Vec<(usize, TestId)>,
}

/// One test with its warm-up time in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedTestRecord {
    pub test: TestId,
    pub warmup_ms: u64,
}

impl RunManifest {
    pub fn new(
        target_fingerprint: String,
        test_list_fingerprint: String,
        order: &TestOrder,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            target_fingerprint,
            test_list_fingerprint,
            total_warmup_ms: order.total_warmup().as_millis() as u64,
            tests: order
                .entries()
                .iter()
                .map(|entry| TimedTestRecord {
                    test: entry.test.clone(),
                    warmup_ms: entry.warmup.as_millis() as u64,
                })
                .collect(),
            killers: order
                .killers()
                .iter()
                .map(|(point, test)| (*point, test.clone()))
                .collect(),
        }
    }

    /// Rebuild the in-memory order. The persisted order is already sorted
    /// (or deliberately unsorted), so it is taken as-is.
    pub fn to_order(&self) -> TestOrder {
        let mut order = TestOrder::from_warmup(
            self.tests
                .iter()
                .map(|record| TimedTest {
                    test: record.test.clone(),
                    warmup: Duration::from_millis(record.warmup_ms),
                })
                .collect(),
            false,
        );
        order.set_killers(
            self.killers
                .iter()
                .cloned()
                .collect::<BTreeMap<usize, TestId>>(),
        );
        order
    }
}

/// Directory of manifest files, one per target, named by content hash.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn manifest_path(&self, target_fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{target_fingerprint}.json"))
    }

    /// Load the manifest for a target, validating version and both
    /// fingerprints. Any mismatch (or unreadable file) discards the entry.
    pub fn load(
        &self,
        target_fingerprint: &str,
        test_list_fingerprint: &str,
    ) -> Option<RunManifest> {
        let path = self.manifest_path(target_fingerprint);
        let raw = fs::read(&path).ok()?;
        let manifest: RunManifest = match serde_json::from_slice(&raw) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(path = %path.display(), %err, "discarding unreadable cache manifest");
                return None;
            }
        };
        if manifest.version != MANIFEST_VERSION
            || manifest.target_fingerprint != target_fingerprint
            || manifest.test_list_fingerprint != test_list_fingerprint
        {
            debug!(path = %path.display(), "cache manifest does not match, ignoring");
            return None;
        }
        Some(manifest)
    }

    /// Write atomically: temp file in the cache directory, then rename.
    pub fn save(&self, manifest: &RunManifest) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(manifest)?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        temp.write_all(&json)?;
        temp.flush()?;
        temp.persist(self.manifest_path(&manifest.target_fingerprint))?;
        Ok(())
    }
}
