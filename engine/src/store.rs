//! Key/value state shared by every branch of a run.
//!
//! The orchestrator writes only two kinds of keys: a per-branch error key on
//! failure and a run-level health key once the run completes. Success results
//! are written by the executors themselves, if at all.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use fanout_types::{BranchResult, HealthSnapshot};
use fanout_utils::{AtomicWriteOptions, PersistMode, atomic_write_with_options, recover_bak_file};

/// Suffix appended to a branch's output key to form its error key.
pub const ERROR_KEY_SUFFIX: &str = "__error";

/// Prefix of the run-level health key; the run name follows.
pub const HEALTH_KEY_PREFIX: &str = "__parallel_health__:";

#[must_use]
pub fn error_key(output_key: &str) -> String {
    format!("{output_key}{ERROR_KEY_SUFFIX}")
}

#[must_use]
pub fn health_key(run_name: &str) -> String {
    format!("{HEALTH_KEY_PREFIX}{run_name}")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("state store lock poisoned")]
    Poisoned,
}

/// Key/value store visible to all branches of a run.
///
/// Writes to different keys must not interfere. A write to an existing key
/// replaces the previous value.
///
/// `set` may block. Branch runners call it through
/// `tokio::task::spawn_blocking`; the run handle calls it inline for the
/// health record and for branches whose runner was lost.
pub trait StateStore: Send + Sync {
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Option<Value>;
}

/// In-process store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry, ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl StateStore for MemoryStore {
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().ok()?.get(key).cloned()
    }
}

/// Store persisted as one pretty-printed JSON object, readable by the owner only.
///
/// Every `set` rewrites the whole file atomically, so a crash leaves either
/// the old or the new contents on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`.
    ///
    /// A leftover `.bak` from an interrupted write is restored first. A missing
    /// or empty file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        recover_bak_file(&path);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let entries = load_entries(&path)?;
        tracing::debug!(path = %path.display(), keys = entries.len(), "opened state file");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

fn write_options() -> AtomicWriteOptions {
    AtomicWriteOptions {
        mode: PersistMode::OwnerOnly,
        ..AtomicWriteOptions::default()
    }
}

fn load_entries(path: &Path) -> Result<BTreeMap<String, Value>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl StateStore for JsonFileStore {
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let previous = entries.insert(key.to_string(), value);

        let persisted = serde_json::to_vec_pretty(&*entries)
            .map_err(StoreError::from)
            .and_then(|bytes| {
                atomic_write_with_options(&self.path, &bytes, write_options()).map_err(|source| {
                    StoreError::Io {
                        path: self.path.clone(),
                        source,
                    }
                })
            });

        // Keep memory in step with disk.
        if persisted.is_err() {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
        }
        persisted
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().ok()?.get(key).cloned()
    }
}

/// Write a failed branch's error message under its error key.
///
/// Store failures are logged and swallowed; they never change the branch's
/// outcome.
pub(crate) fn record_branch_error(store: &dyn StateStore, result: &BranchResult) {
    let Some(error) = result.error() else {
        return;
    };
    let key = error_key(result.output_key());
    if let Err(e) = store.set(&key, Value::String(error.to_string())) {
        tracing::warn!(
            branch = %result.branch_id(),
            key = %key,
            error = %e,
            "failed to record branch error"
        );
    }
}

/// Write the run's health snapshot under its health key.
pub(crate) fn record_health(store: &dyn StateStore, run_name: &str, snapshot: &HealthSnapshot) {
    let key = health_key(run_name);
    let value = match serde_json::to_value(snapshot) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(run = %run_name, error = %e, "failed to serialize health snapshot");
            return;
        }
    };
    if let Err(e) = store.set(&key, value) {
        tracing::warn!(run = %run_name, key = %key, error = %e, "failed to record run health");
    }
}
