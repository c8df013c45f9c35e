//! Class resolution policy for mutant runs.
//!
//! One loader serves exactly one mutant: the target class comes from the
//! mutated image in memory, deferred names (platform classes, the test
//! framework, anything the harness must share with its parent) are delegated,
//! and everything else is read from the configured classpath and defined
//! locally so no static state leaks between mutants.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Class prefixes that always belong to the platform runtime and must keep a
/// single identity with the harness.
pub const PLATFORM_PREFIXES: [&str; 5] = ["java.", "javax.", "jdk.", "sun.", "com.sun."];

/// Loader-level errors.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("class {name} not found on classpath")]
    NotFound { name: String },
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How a name was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The target class, served from the mutated image.
    Mutated(Vec<u8>),
    /// Delegated to the parent loader; the bytes are not ours to supply.
    Deferred,
    /// Read from the classpath and defined locally.
    Local(Vec<u8>),
}

/// Classloader substituting a mutated image for one class name.
#[derive(Debug)]
pub struct MutatingClassLoader {
    target_name: String,
    target_bytes: Vec<u8>,
    deferred: Vec<String>,
    classpath: Vec<PathBuf>,
    resolved: HashMap<String, Vec<u8>>,
}

impl MutatingClassLoader {
    pub fn new(
        target_name: impl Into<String>,
        target_bytes: Vec<u8>,
        deferred: Vec<String>,
        classpath: Vec<PathBuf>,
    ) -> Self {
        Self {
            target_name: target_name.into(),
            target_bytes,
            deferred,
            classpath,
            resolved: HashMap::new(),
        }
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// True when `name` must be delegated to the parent loader.
    pub fn is_deferred(&self, name: &str) -> bool {
        PLATFORM_PREFIXES
            .iter()
            .map(|prefix| *prefix)
            .chain(self.deferred.iter().map(String::as_str))
            .any(|prefix| name.starts_with(prefix))
    }

    /// Resolve `name` per the substitution policy. The same mutated image is
    /// returned on every request; a class is never re-mutated.
    pub fn resolve(&mut self, name: &str) -> Result<Resolution, LoaderError> {
        if name == self.target_name {
            return Ok(Resolution::Mutated(self.target_bytes.clone()));
        }
        if self.is_deferred(name) {
            return Ok(Resolution::Deferred);
        }
        if let Some(bytes) = self.resolved.get(name) {
            return Ok(Resolution::Local(bytes.clone()));
        }
        let relative = class_file_path(name);
        for root in &self.classpath {
            let path = root.join(&relative);
            if path.is_file() {
                let bytes = fs::read(&path).map_err(|source| LoaderError::Io {
                    path: path.clone(),
                    source,
                })?;
                debug!(name, path = %path.display(), "defined class locally");
                self.resolved.insert(name.to_string(), bytes.clone());
                return Ok(Resolution::Local(bytes));
            }
        }
        Err(LoaderError::NotFound {
            name: name.to_string(),
        })
    }

    /// Bytes previously served for `name`, for consumers that re-read a
    /// class as a resource stream. The target is always visible.
    pub fn lookup_bytes(&self, name: &str) -> Option<&[u8]> {
        if name == self.target_name {
            return Some(&self.target_bytes);
        }
        self.resolved.get(name).map(Vec::as_slice)
    }

    /// Write the mutated class and every class defined locally so far into
    /// `dir`, producing the overlay directory the external harness puts
    /// first on its classpath. Deferred names stay absent so they resolve
    /// through the harness's own loader.
    pub fn materialize(&self, dir: &Path) -> Result<(), LoaderError> {
        write_class(dir, &self.target_name, &self.target_bytes)?;
        for (name, bytes) in &self.resolved {
            write_class(dir, name, bytes)?;
        }
        Ok(())
    }
}

fn write_class(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), LoaderError> {
    let path = dir.join(class_file_path(name));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| LoaderError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(&path, bytes).map_err(|source| LoaderError::Io { path, source })
}

/// Read the unmutated bytes of `name` from classpath roots, outside any
/// loader. Used wherever the pristine target image is needed.
pub fn find_class_bytes(classpath: &[PathBuf], name: &str) -> Result<Vec<u8>, LoaderError> {
    let relative = class_file_path(name);
    for root in classpath {
        let path = root.join(&relative);
        if path.is_file() {
            return fs::read(&path).map_err(|source| LoaderError::Io { path, source });
        }
    }
    Err(LoaderError::NotFound {
        name: name.to_string(),
    })
}

/// `a.b.C` -> `a/b/C.class`.
fn class_file_path(name: &str) -> PathBuf {
    let mut path: PathBuf = name.split('.').collect();
    path.set_extension("class");
    path
}

/// Split a platform-style classpath string into directory roots.
pub fn split_classpath(classpath: &str) -> Vec<PathBuf> {
    std::env::split_paths(classpath).collect()
}

/// Join directory roots back into a platform-style classpath string.
pub fn join_classpath(roots: &[PathBuf]) -> String {
    std::env::join_paths(roots)
        .map(|joined| joined.to_string_lossy().into_owned())
        .unwrap_or_default()
}
