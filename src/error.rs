//! Rich diagnostic error types for the synth-dialogue pipeline.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. Per-record failures (gateway, stage) are
//! contained by the engine; only store and checkpoint errors halt a run.

use miette::Diagnostic;
use thiserror::Error;

use crate::record::Record;

/// Top-level error type for a pipeline run.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Record store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("input not found: {path}")]
    #[diagnostic(
        code(synth::store::missing_input),
        help("Check the stage's `input` path. Nothing was dispatched.")
    )]
    MissingInput { path: String },

    #[error("malformed record at {location}: {message}")]
    #[diagnostic(
        code(synth::store::malformed_record),
        help(
            "Each entry must be a JSON object carrying the configured identifier field \
             as a string or integer. The entry was skipped."
        )
    )]
    MalformedRecord { location: String, message: String },

    #[error("I/O error reading {path}")]
    #[diagnostic(
        code(synth::store::io),
        help("Check that the file is readable and not locked by another process.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Inference gateway errors (every variant is an inference failure)
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GatewayError {
    #[error("no inference backends configured")]
    #[diagnostic(
        code(synth::gateway::no_backends),
        help(
            "Set `gateway.api_keys` in the config file or export \
             SYNTH_DIALOGUE_API_KEYS as a comma-separated list."
        )
    )]
    NoBackends,

    #[error("request to {endpoint} failed: {message}")]
    #[diagnostic(
        code(synth::gateway::transport),
        help("Check network connectivity and the configured base URL.")
    )]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} returned status {status}: {body}")]
    #[diagnostic(
        code(synth::gateway::status),
        help("A 401 means a bad key; 429 means rate limiting. Adding keys spreads the load.")
    )]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("malformed completion envelope: {message}")]
    #[diagnostic(
        code(synth::gateway::envelope),
        help("The service did not answer in chat-completion format. Check `gateway.base_url`.")
    )]
    Envelope { message: String },

    #[error("completion had no content")]
    #[diagnostic(code(synth::gateway::empty_completion))]
    EmptyCompletion,

    #[error("could not parse structured response: {reason}")]
    #[diagnostic(
        code(synth::gateway::parse),
        help("The model answered, but not with a JSON object carrying the required keys.")
    )]
    Parse { reason: String, raw: String },
}

// ---------------------------------------------------------------------------
// Stage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    #[error("record {id}: gave up after {attempts} attempt(s)")]
    #[diagnostic(
        code(synth::stage::exhausted_retries),
        help("The record stays pending and will be retried on the next run.")
    )]
    ExhaustedRetries {
        id: String,
        attempts: u32,
        #[source]
        last: GatewayError,
    },

    #[error("record {id} is missing required field(s): {fields}")]
    #[diagnostic(
        code(synth::stage::missing_fields),
        help("Run the preceding stage for this record first, or set `on_missing_fields = \"skip\"`.")
    )]
    MissingFields { id: String, fields: String },

    #[error("record {id}: {message}")]
    #[diagnostic(code(synth::stage::invalid))]
    Invalid { id: String, message: String },

    #[error("{source} ({saved} step(s) saved)")]
    #[diagnostic(
        code(synth::stage::unfinished),
        help("The saved steps are checkpointed; the rest are retried on the next run.")
    )]
    Unfinished {
        saved: usize,
        partial: Box<Record>,
        #[source]
        source: Box<StageError>,
    },
}

impl StageError {
    /// Wrap `self` with the progress a record made before failing.
    pub fn with_partial(self, partial: Record, saved: usize) -> Self {
        if saved == 0 {
            return self;
        }
        StageError::Unfinished {
            saved,
            partial: Box::new(partial),
            source: Box::new(self),
        }
    }

    /// Split off the partial record, if any.
    pub fn into_parts(self) -> (StageError, Option<Record>) {
        match self {
            StageError::Unfinished { partial, source, .. } => (*source, Some(*partial)),
            other => (other, None),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("failed to persist checkpoint to {path} after {attempts} attempt(s)")]
    #[diagnostic(
        code(synth::checkpoint::persistence_failure),
        help(
            "Completed results are still in memory but could not be written. \
             Check disk space and permissions; the next run will redo unsaved records."
        )
    )]
    PersistenceFailure {
        path: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode checkpoint: {message}")]
    #[diagnostic(code(synth::checkpoint::encode))]
    Encode { message: String },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(synth::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(synth::config::parse),
        help("Check the TOML syntax in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to encode config: {message}")]
    #[diagnostic(code(synth::config::encode))]
    Encode { message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(synth::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {message}")]
    #[diagnostic(code(synth::config::invalid), help("{message}"))]
    Invalid { message: String },
}

/// Convenience alias for functions returning pipeline results.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
pub type StageResult<T> = std::result::Result<T, StageError>;
