//! AgentPay Store - Snapshot persistence
//!
//! Every engine persists its whole collection as a pretty-printed JSON file
//! rewritten after each successful mutation. Writes go to a sibling temp
//! file and land via rename, so a crash mid-write leaves either the prior
//! or the new snapshot intact - never a torn one.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors raised by snapshot and log I/O
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed snapshot {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for agentpay_types::AgentPayError {
    fn from(err: StoreError) -> Self {
        agentpay_types::AgentPayError::storage(err.to_string())
    }
}

/// A whole-file JSON snapshot at a fixed path
#[derive(Debug, Clone)]
pub struct JsonSnapshot {
    path: PathBuf,
}

impl JsonSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot path under a data directory
    pub fn in_dir(dir: impl AsRef<Path>, file_name: &str) -> Self {
        Self::new(dir.as_ref().join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the snapshot atomically (temp file + rename)
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), "snapshot written");
        Ok(())
    }

    /// Read the snapshot; `None` when the file does not exist yet
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let value = serde_json::from_slice(&content).map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(value))
    }
}

/// One entry in the operational event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    /// Entry kind, e.g. an event-type tag or `delivery_failed`
    pub kind: String,
    pub detail: String,
}

impl LogEntry {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

/// Append-ordered log keeping the most recent `max_entries`; older entries
/// are truncated from the head on save
#[derive(Debug)]
pub struct EventLog {
    snapshot: JsonSnapshot,
    max_entries: usize,
    entries: Vec<LogEntry>,
}

impl EventLog {
    /// Open the log at `path`, rehydrating any persisted entries
    pub fn open(path: impl Into<PathBuf>, max_entries: usize) -> Result<Self> {
        let snapshot = JsonSnapshot::new(path);
        let entries: Vec<LogEntry> = snapshot.load()?.unwrap_or_default();
        Ok(Self {
            snapshot,
            max_entries,
            entries,
        })
    }

    /// Append an entry and persist the truncated log
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        self.entries.push(entry);
        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(..excess);
        }
        self.snapshot.save(&self.entries)
    }

    /// The most recent `n` entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let start = self.entries.len().saturating_sub(n);
        self.entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
