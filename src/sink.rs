//! Row output.
//!
//! [`CsvSink`] lays files out as
//! `<root>/<mode dir>/<prefix>_<target>_<YYYYmmdd_HHMMSS>.csv`, one file per
//! (mode, target) per process, opened on the first row.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::CollectionMode;
use crate::target::Target;

pub trait OutputSink: Send + Sync {
    fn write_row(&self, mode: CollectionMode, target: &Target, row: Vec<String>) -> Result<()>;

    /// Push buffered rows to durable storage. Checkpoints are only written
    /// after this returns `Ok`.
    fn flush(&self) -> Result<()>;
}

struct OpenFile {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: u64,
}

pub struct CsvSink {
    root: PathBuf,
    stamp: String,
    files: Mutex<HashMap<(CollectionMode, String), OpenFile>>,
}

impl CsvSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stamp: Local::now().format("%Y%m%d_%H%M%S").to_string(),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths written so far with their row counts.
    pub fn written_files(&self) -> Vec<(PathBuf, u64)> {
        let files = self.files.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<_> = files.values().map(|f| (f.path.clone(), f.rows)).collect();
        out.sort();
        out
    }

    fn path_for(&self, mode: CollectionMode, target: &Target) -> PathBuf {
        self.root.join(mode.dir_name()).join(format!(
            "{}_{}_{}.csv",
            mode.file_prefix(),
            target.output_name(),
            self.stamp
        ))
    }

    fn open(&self, mode: CollectionMode, target: &Target) -> Result<OpenFile> {
        let path = self.path_for(mode, target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Output(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(mode.header())?;
        Ok(OpenFile {
            path,
            writer,
            rows: 0,
        })
    }
}

impl OutputSink for CsvSink {
    fn write_row(&self, mode: CollectionMode, target: &Target, row: Vec<String>) -> Result<()> {
        let mut files = self.files.lock().unwrap_or_else(|p| p.into_inner());
        let key = (mode, target.key());
        if !files.contains_key(&key) {
            let file = self.open(mode, target)?;
            info!(path = %file.path.display(), "writing {}", mode.label());
            files.insert(key.clone(), file);
        }
        if let Some(file) = files.get_mut(&key) {
            file.writer.write_record(&row)?;
            file.rows += 1;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut files = self.files.lock().unwrap_or_else(|p| p.into_inner());
        for file in files.values_mut() {
            file.writer
                .flush()
                .map_err(|e| Error::Output(format!("{}: {}", file.path.display(), e)))?;
        }
        Ok(())
    }
}

/// One row as seen by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRow {
    pub mode: CollectionMode,
    pub target_key: String,
    pub fields: Vec<String>,
}

/// Keeps rows in memory; rows become visible in `flushed()` only after
/// `flush`.
#[derive(Debug, Default)]
pub struct MemorySink {
    pending: Mutex<Vec<RecordedRow>>,
    flushed: Mutex<Vec<RecordedRow>>,
    flushes: Mutex<u64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flushed(&self) -> Vec<RecordedRow> {
        self.flushed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn rows_for(&self, mode: CollectionMode) -> Vec<Vec<String>> {
        self.flushed()
            .into_iter()
            .filter(|r| r.mode == mode)
            .map(|r| r.fields)
            .collect()
    }

    /// Flushes that carried at least one row.
    pub fn flush_count(&self) -> u64 {
        *self.flushes.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl OutputSink for MemorySink {
    fn write_row(&self, mode: CollectionMode, target: &Target, row: Vec<String>) -> Result<()> {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(RecordedRow {
                mode,
                target_key: target.key(),
                fields: row,
            });
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if pending.is_empty() {
            return Ok(());
        }
        self.flushed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .append(&mut pending);
        *self.flushes.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }
}
