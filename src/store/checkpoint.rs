//! Checkpoint collection and atomic writer.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::CheckpointError;
use crate::record::{Record, RecordId};
use crate::retry::RetryPolicy;

use super::{CollectionFormat, temp_path};

/// Ordered, id-keyed set of records.
///
/// First-seen order is kept; merging a record with a known id replaces the
/// stored copy in place.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSet {
    records: Vec<Record>,
    index: HashMap<RecordId, usize>,
}

impl CheckpointSet {
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut set = Self::default();
        set.extend(records);
        set
    }

    /// Insert or replace. Returns `true` when an existing entry was replaced.
    pub fn merge(&mut self, record: Record) -> bool {
        match self.index.get(record.id()) {
            Some(&pos) => {
                self.records[pos] = record;
                true
            }
            None => {
                self.index.insert(record.id().clone(), self.records.len());
                self.records.push(record);
                false
            }
        }
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = Record>) {
        for record in records {
            self.merge(record);
        }
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.index.get(id).map(|&pos| &self.records[pos])
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.index.contains_key(id)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize in the given format.
    pub fn encode(&self, format: CollectionFormat) -> Result<Vec<u8>, CheckpointError> {
        let encode_err = |e: serde_json::Error| CheckpointError::Encode {
            message: e.to_string(),
        };
        match format {
            CollectionFormat::Array => {
                let mut buf = serde_json::to_vec_pretty(&self.records).map_err(encode_err)?;
                buf.push(b'\n');
                Ok(buf)
            }
            CollectionFormat::Lines => {
                let mut buf = Vec::new();
                for record in &self.records {
                    serde_json::to_writer(&mut buf, record).map_err(encode_err)?;
                    buf.push(b'\n');
                }
                Ok(buf)
            }
        }
    }
}

/// Writes a [`CheckpointSet`] to one output path via temp file + rename.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    path: PathBuf,
    format: CollectionFormat,
    retry: RetryPolicy,
}

impl CheckpointWriter {
    pub fn new(path: impl Into<PathBuf>, format: CollectionFormat) -> Self {
        Self {
            path: path.into(),
            format,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> CollectionFormat {
        self.format
    }

    /// Persist `set`. Readers of the final path only ever see a complete file.
    pub fn flush(&self, set: &CheckpointSet) -> Result<(), CheckpointError> {
        let bytes = set.encode(self.format)?;
        self.retry
            .run(|attempt| {
                write_atomic(&self.path, &bytes).inspect_err(|e| {
                    tracing::warn!(path = %self.path.display(), attempt, error = %e, "checkpoint write failed");
                })
            })
            .map_err(|ex| CheckpointError::PersistenceFailure {
                path: self.path.display().to_string(),
                attempts: ex.attempts,
                source: ex.last,
            })?;
        tracing::debug!(path = %self.path.display(), records = set.len(), "checkpoint flushed");
        Ok(())
    }
}

/// Write `bytes` to `<path>.temp`, sync, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let temp = temp_path(path);
    {
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&temp, path)
}
