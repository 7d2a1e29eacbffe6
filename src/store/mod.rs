//! Record collections on disk.
//!
//! Two on-disk shapes are supported, and every stage can read either:
//!
//! - [`CollectionFormat::Array`]: one JSON array of objects
//! - [`CollectionFormat::Lines`]: one JSON object per line
//!
//! [`load`] computes pending work from an input and a previous output;
//! [`checkpoint`] merges results and swaps them onto disk atomically.

pub mod checkpoint;
pub mod load;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::Record;

pub use checkpoint::{CheckpointSet, CheckpointWriter};
pub use load::{LoadedWork, load_pending, load_pending_with, read_existing, read_input};

/// Shape of a collection file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionFormat {
    /// Pretty-printed JSON array.
    #[default]
    Array,
    /// Line-delimited JSON.
    Lines,
}

impl CollectionFormat {
    /// Guess the format from file contents: a leading `[` means array.
    pub fn detect(text: &str) -> Self {
        if text.trim_start().starts_with('[') {
            Self::Array
        } else {
            Self::Lines
        }
    }
}

impl std::fmt::Display for CollectionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Array => f.write_str("array"),
            Self::Lines => f.write_str("lines"),
        }
    }
}

/// Sibling path used for in-progress checkpoint writes: `<path>.temp`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(".temp");
    PathBuf::from(s)
}

/// Result of decoding a collection: the records plus how many entries were dropped.
#[derive(Debug, Default)]
pub struct Decoded {
    pub records: Vec<Record>,
    pub skipped: usize,
}

impl Decoded {
    pub fn is_clean(&self) -> bool {
        self.skipped == 0
    }
}

/// Decode a collection leniently.
///
/// Arrays are parsed whole; if that fails (for example a truncated write),
/// every complete top-level object is recovered. Line files are parsed line
/// by line, ignoring blank lines, bare `[`/`]` and trailing commas. Entries
/// that cannot be parsed are skipped with a warning.
pub fn decode(text: &str, id_field: &str, source: &str) -> Decoded {
    let mut out = Decoded::default();
    match CollectionFormat::detect(text) {
        CollectionFormat::Array => match serde_json::from_str::<Vec<Value>>(text) {
            Ok(values) => {
                for (i, value) in values.into_iter().enumerate() {
                    push_record(&mut out, value, id_field, &format!("{source}[{i}]"));
                }
            }
            Err(e) => {
                tracing::warn!(source, error = %e, "collection is not a complete array, recovering entries");
                let spans = top_level_objects(text);
                for (i, span) in spans.iter().enumerate() {
                    match serde_json::from_str::<Value>(span) {
                        Ok(value) => {
                            push_record(&mut out, value, id_field, &format!("{source}[{i}]"))
                        }
                        Err(e) => {
                            tracing::warn!(source, index = i, error = %e, "skipping unparsable entry");
                            out.skipped += 1;
                        }
                    }
                }
                // Whatever followed the last complete object was lost.
                out.skipped += 1;
            }
        },
        CollectionFormat::Lines => {
            for (n, line) in text.lines().enumerate() {
                let line = line.trim().trim_end_matches(',');
                if line.is_empty() || line == "[" || line == "]" {
                    continue;
                }
                let location = format!("{source}:{}", n + 1);
                match serde_json::from_str::<Value>(line) {
                    Ok(value) => push_record(&mut out, value, id_field, &location),
                    Err(e) => {
                        let preview: String = line.chars().take(50).collect();
                        tracing::warn!(%location, error = %e, preview = %preview, "skipping unparsable line");
                        out.skipped += 1;
                    }
                }
            }
        }
    }
    out
}

fn push_record(out: &mut Decoded, value: Value, id_field: &str, location: &str) {
    match Record::from_value(value, id_field, location) {
        Ok(record) => out.records.push(record),
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed record");
            out.skipped += 1;
        }
    }
}

/// Text of every complete object directly inside a (possibly truncated) array.
fn top_level_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in bytes.iter().enumerate() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            b'"' => in_string = true,
            b'[' | b'{' => {
                depth += 1;
                if c == b'{' && depth == 2 {
                    start = Some(i);
                }
            }
            b']' | b'}' => {
                if c == b'}' && depth == 2 {
                    if let Some(s) = start.take() {
                        spans.push(&text[s..=i]);
                    }
                }
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }
    }
    spans
}
