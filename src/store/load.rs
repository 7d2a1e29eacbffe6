//! Record store: figure out what still needs doing.

use std::collections::HashSet;
use std::path::Path;

use crate::error::{StoreError, StoreResult};
use crate::record::{Record, RecordId};

use super::checkpoint::CheckpointSet;
use super::{decode, temp_path};

/// Work computed for one stage run.
#[derive(Debug)]
pub struct LoadedWork {
    /// Records to dispatch, in input order.
    pub pending: Vec<Record>,
    /// Identifiers that are finished and must not be dispatched.
    pub already_done: HashSet<RecordId>,
    /// Everything loaded from the previous output.
    pub existing: CheckpointSet,
    /// Number of input records after de-duplication.
    pub input_total: usize,
}

/// Read an input collection. A missing file is fatal; bad entries are skipped.
pub fn read_input(path: &Path, id_field: &str) -> StoreResult<Vec<Record>> {
    if !path.exists() {
        return Err(StoreError::MissingInput {
            path: path.display().to_string(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|e| StoreError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let decoded = decode(&text, id_field, &path.display().to_string());
    if decoded.skipped > 0 {
        tracing::warn!(path = %path.display(), skipped = decoded.skipped, "input had malformed entries");
    }

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(decoded.records.len());
    for record in decoded.records {
        if seen.insert(record.id().clone()) {
            records.push(record);
        } else {
            tracing::warn!(id = %record.id(), "duplicate input id, keeping the first occurrence");
        }
    }
    Ok(records)
}

/// Read a previous output plus any `<path>.temp` left by an interrupted
/// checkpoint swap. Never fails: unreadable output counts as empty.
///
/// The temp file is newer than the main file but may be a clean prefix of
/// it (a line-delimited write cut off at a newline), so the two are merged
/// with the temp copy winning per id rather than one replacing the other.
pub fn read_existing(path: &Path, id_field: &str) -> CheckpointSet {
    let mut set = read_main(path, id_field);
    let temp = temp_path(path);
    if !temp.exists() {
        return set;
    }
    match std::fs::read_to_string(&temp) {
        Ok(text) => {
            let decoded = decode(&text, id_field, &temp.display().to_string());
            if decoded.is_clean() {
                tracing::info!(
                    path = %temp.display(),
                    records = decoded.records.len(),
                    "merging unswapped checkpoint"
                );
                set.extend(decoded.records);
            } else {
                tracing::warn!(path = %temp.display(), "ignoring incomplete temporary checkpoint");
            }
        }
        Err(e) => {
            tracing::warn!(path = %temp.display(), error = %e, "cannot read temporary checkpoint");
        }
    }
    set
}

fn read_main(path: &Path, id_field: &str) -> CheckpointSet {
    if !path.exists() {
        return CheckpointSet::default();
    }
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let decoded = decode(&text, id_field, &path.display().to_string());
            if decoded.skipped > 0 {
                tracing::warn!(path = %path.display(), skipped = decoded.skipped, "recovered partially written output");
            }
            CheckpointSet::from_records(decoded.records)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to load existing output, starting empty");
            CheckpointSet::default()
        }
    }
}

/// Pending work where presence in the output means done.
pub fn load_pending(input: &Path, output: &Path, id_field: &str) -> StoreResult<LoadedWork> {
    load_pending_with(input, output, id_field, |_| true)
}

/// Pending work with a custom completion test.
///
/// An output record failing `is_complete` is re-queued using the output copy,
/// since it carries more accumulated fields than the input copy. Output records
/// whose id is not in the input are kept but never dispatched.
pub fn load_pending_with<F>(
    input: &Path,
    output: &Path,
    id_field: &str,
    is_complete: F,
) -> StoreResult<LoadedWork>
where
    F: Fn(&Record) -> bool,
{
    let inputs = read_input(input, id_field)?;
    let existing = read_existing(output, id_field);

    let already_done: HashSet<RecordId> = existing
        .records()
        .iter()
        .filter(|r| is_complete(r))
        .map(|r| r.id().clone())
        .collect();

    let input_total = inputs.len();
    let pending = inputs
        .into_iter()
        .filter(|r| !already_done.contains(r.id()))
        .map(|r| existing.get(r.id()).cloned().unwrap_or(r))
        .collect();

    Ok(LoadedWork {
        pending,
        already_done,
        existing,
        input_total,
    })
}
