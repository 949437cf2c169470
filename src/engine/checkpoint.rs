//! Resume checkpoints keyed by (target, job).
//!
//! A checkpoint is written only after the batch it describes has been flushed,
//! so it never points past data that reached the sink.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::dedup::SeenSet;
use crate::engine::pager::CollectionCursor;
use crate::error::{Error, Result};
use crate::target::safe_name;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub target_key: String,
    pub job_key: String,
    pub cursor: CollectionCursor,
    pub seen: SeenSet,
    /// Invite links already written by a history run.
    #[serde(default)]
    pub invite_seen: SeenSet,
    pub rows_written: u64,
    pub updated_at: DateTime<Utc>,
}

/// Persistence for checkpoints. `save` overwrites atomically.
pub trait ResumeStore: Send + Sync {
    fn load(&self, target_key: &str, job_key: &str) -> Result<Option<RunCheckpoint>>;
    fn save(&self, checkpoint: &RunCheckpoint) -> Result<()>;
    fn clear(&self, target_key: &str, job_key: &str) -> Result<()>;
}

/// One JSON file per (target, job) under a directory.
#[derive(Debug, Clone)]
pub struct FileResumeStore {
    dir: PathBuf,
}

impl FileResumeStore {
    /// Open the store, creating the directory and confirming it is writable.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::CheckpointStore(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let probe = dir.join(".write-test");
        File::create(&probe)
            .and_then(|mut f| f.write_all(b"ok"))
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|e| {
                Error::CheckpointStore(format!("{} is not writable: {}", dir.display(), e))
            })?;

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, target_key: &str, job_key: &str) -> PathBuf {
        self.dir
            .join(format!("{}__{}.json", safe_name(target_key), safe_name(job_key)))
    }
}

impl ResumeStore for FileResumeStore {
    fn load(&self, target_key: &str, job_key: &str) -> Result<Option<RunCheckpoint>> {
        let path = self.path_for(target_key, job_key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::CheckpointStore(format!("{}: {}", path.display(), e))),
        };
        let checkpoint: RunCheckpoint = serde_json::from_str(&content).map_err(|e| {
            Error::CheckpointStore(format!("corrupt checkpoint {}: {}", path.display(), e))
        })?;
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &RunCheckpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.target_key, &checkpoint.job_key);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec(checkpoint)?;

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| Error::CheckpointStore(format!("{}: {}", path.display(), e)))?;

        debug!(
            path = %path.display(),
            seq = checkpoint.cursor.seq,
            rows = checkpoint.rows_written,
            "checkpoint saved"
        );
        Ok(())
    }

    fn clear(&self, target_key: &str, job_key: &str) -> Result<()> {
        let path = self.path_for(target_key, job_key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::CheckpointStore(format!("{}: {}", path.display(), e))),
        }
    }
}

/// In-process store for tests.
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    entries: Mutex<HashMap<(String, String), RunCheckpoint>>,
    saves: Mutex<u64>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResumeStore for MemoryResumeStore {
    fn load(&self, target_key: &str, job_key: &str) -> Result<Option<RunCheckpoint>> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entries
            .get(&(target_key.to_string(), job_key.to_string()))
            .cloned())
    }

    fn save(&self, checkpoint: &RunCheckpoint) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            (checkpoint.target_key.clone(), checkpoint.job_key.clone()),
            checkpoint.clone(),
        );
        *self.saves.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }

    fn clear(&self, target_key: &str, job_key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(&(target_key.to_string(), job_key.to_string()));
        Ok(())
    }
}
