//! Device-local persistence
//!
//! One small record per device holds the device id and whether (and for
//! whom) this device has voted. It is advisory: the shared store is the
//! source of truth, and the record never overrides a remote "already voted".
//!
//! Key names (`deviceId`, `hasVoted`, `votedFor`) are stable across
//! releases so records written by older builds keep loading.

pub mod cache;
pub mod identity;

use crate::types::{CandidateId, DeviceId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub use cache::LocalElectionCache;
pub use identity::DeviceIdentity;

/// The persisted per-device record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    #[serde(default)]
    pub has_voted: bool,
    #[serde(default)]
    pub voted_for: Option<CandidateId>,
    #[serde(default)]
    pub voted_at: Option<DateTime<Utc>>,
}

/// Durable storage for the [`LocalRecord`]
///
/// Implementations do no network access. `load` returns `Ok(None)` when no
/// record has been written yet and `Err` when storage itself is unusable.
pub trait LocalStore: Send + Sync {
    fn load(&self) -> Result<Option<LocalRecord>>;

    fn save(&self, record: &LocalRecord) -> Result<()>;

    /// Read-modify-write of the record
    fn update(&self, apply: &mut dyn FnMut(&mut LocalRecord)) -> Result<LocalRecord> {
        let mut record = self.load()?.unwrap_or_default();
        apply(&mut record);
        self.save(&record)?;
        Ok(record)
    }
}

/// JSON file on disk, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LocalStore for FileStore {
    fn load(&self) -> Result<Option<LocalRecord>> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::persistence(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let record = serde_json::from_str(&json).map_err(|e| {
            Error::persistence(format!("corrupt record {}: {}", self.path.display(), e))
        })?;
        Ok(Some(record))
    }

    fn save(&self, record: &LocalRecord) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::persistence(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let json = serde_json::to_string_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| {
                Error::persistence(format!("cannot write {}: {}", self.path.display(), e))
            })
    }
}

/// Volatile record for tests and storage-less hosts
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: Mutex<Option<LocalRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing record
    pub fn with_record(record: LocalRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }
}

impl LocalStore for MemoryStore {
    fn load(&self) -> Result<Option<LocalRecord>> {
        let record = self
            .record
            .lock()
            .map_err(|_| Error::internal("Local record lock poisoned"))?;
        Ok(record.clone())
    }

    fn save(&self, new_record: &LocalRecord) -> Result<()> {
        let mut record = self
            .record
            .lock()
            .map_err(|_| Error::internal("Local record lock poisoned"))?;
        *record = Some(new_record.clone());
        Ok(())
    }
}
