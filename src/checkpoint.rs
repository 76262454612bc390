//! Poller checkpoint persistence
//!
//! Each polling source persists an opaque [`Cursor`] under a stable key so
//! a restart resumes the same logical stream. The file store keeps every
//! source's cursor in one JSON document; without a configured path the
//! engine falls back to the in-memory store for the process lifetime.

use crate::error::{IngestError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

/// Continuation marker for one polling source
///
/// Cursors are ordered: a source must issue tokens whose lexicographic
/// order follows stream position. Timestamp cursors use a fixed-width
/// RFC 3339 UTC form so this holds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Cursor positioned at a point in time
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Interpret the token as a timestamp, if it is one
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.0)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trait for persisting poller cursors
pub trait CheckpointStore: Send + Sync {
    /// Load the cursor saved under `key`, if any
    fn load(&self, key: &str) -> Result<Option<Cursor>>;

    /// Save `cursor` under `key`, replacing any previous value
    fn save(&self, key: &str, cursor: &Cursor) -> Result<()>;
}

/// JSON file-based checkpoint store
///
/// Atomic writes via temp file + rename to prevent corruption.
pub struct FileCheckpointStore {
    path: PathBuf,

    /// Serializes read-modify-write cycles between pollers
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Create a new file checkpoint store at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, Cursor>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            IngestError::Checkpoint(format!(
                "Failed to read checkpoint file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        serde_json::from_str(&json).map_err(|e| {
            IngestError::Checkpoint(format!(
                "Failed to parse checkpoint file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn write_all(&self, cursors: &HashMap<String, Cursor>) -> Result<()> {
        let json = serde_json::to_string_pretty(cursors)?;

        // Atomic write: write to temp file, then rename
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IngestError::Checkpoint(format!(
                    "Failed to create checkpoint directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        std::fs::write(&tmp_path, json).map_err(|e| {
            IngestError::Checkpoint(format!(
                "Failed to write checkpoint file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            IngestError::Checkpoint(format!(
                "Failed to rename checkpoint file {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, key: &str) -> Result<Option<Cursor>> {
        let cursors = self.read_all()?;
        Ok(cursors.get(key).cloned())
    }

    fn save(&self, key: &str, cursor: &Cursor) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|e| {
            IngestError::Checkpoint(format!("Failed to acquire checkpoint lock: {}", e))
        })?;

        let mut cursors = self.read_all()?;
        cursors.insert(key.to_string(), cursor.clone());
        self.write_all(&cursors)?;

        tracing::debug!(
            path = %self.path.display(),
            key = %key,
            cursor = %cursor,
            "Checkpoint saved"
        );
        Ok(())
    }
}

/// In-memory checkpoint store
///
/// Cursors are lost on drop; used when no storage path is configured.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    cursors: RwLock<HashMap<String, Cursor>>,
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, key: &str) -> Result<Option<Cursor>> {
        let cursors = self.cursors.read().map_err(|e| {
            IngestError::Checkpoint(format!("Failed to acquire checkpoint lock: {}", e))
        })?;
        Ok(cursors.get(key).cloned())
    }

    fn save(&self, key: &str, cursor: &Cursor) -> Result<()> {
        let mut cursors = self.cursors.write().map_err(|e| {
            IngestError::Checkpoint(format!("Failed to acquire checkpoint lock: {}", e))
        })?;
        cursors.insert(key.to_string(), cursor.clone());
        Ok(())
    }
}
