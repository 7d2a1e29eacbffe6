//! Batch engine: top-level API for running one stage over a collection.
//!
//! The `Engine` owns the gateway, the worker settings and the shutdown flag.
//! A run loads the pending work, dispatches it to the worker pool in chunks,
//! merges every completed record (and the saved progress of failed ones) into
//! the checkpoint set and flushes it to
//! disk after each chunk. Only the coordinating thread touches the set.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{GatewayError, PipelineResult, StageError};
use crate::llm::Gateway;
use crate::pipeline::{MissingFieldPolicy, Stage, StageContext, StageKind};
use crate::pool::{HandlerError, Outcome, WorkerPool};
use crate::progress::ProgressReporter;
use crate::record::{DEFAULT_ID_FIELD, Record, RecordId};
use crate::retry::RetryPolicy;
use crate::store::{self, CheckpointSet, CheckpointWriter, CollectionFormat};

/// Execution settings shared by every stage run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Records processed concurrently.
    pub workers: usize,
    /// Completed records between checkpoint flushes. Zero flushes once at the end.
    pub batch_size: usize,
    /// Retry policy for inference calls and checkpoint writes.
    pub retry: RetryPolicy,
    /// Draw a progress bar on stderr.
    pub show_progress: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 25,
            retry: RetryPolicy::default(),
            show_progress: true,
        }
    }
}

/// One stage applied to one input file, writing one output file.
#[derive(Debug, Clone)]
pub struct StageJob {
    pub kind: StageKind,
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: CollectionFormat,
    pub model: String,
    pub temperature: f32,
    pub id_field: String,
    pub on_missing_fields: MissingFieldPolicy,
}

impl StageJob {
    /// A job with the stage's default model, temperature and output format.
    pub fn new(kind: StageKind, input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            input: input.into(),
            output: output.into(),
            format: kind.default_format(),
            model: kind.default_model().to_string(),
            temperature: kind.default_temperature(),
            id_field: DEFAULT_ID_FIELD.to_string(),
            on_missing_fields: MissingFieldPolicy::default(),
        }
    }

    pub fn with_format(mut self, format: CollectionFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>, temperature: f32) -> Self {
        self.model = model.into();
        self.temperature = temperature;
        self
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn with_missing_fields(mut self, policy: MissingFieldPolicy) -> Self {
        self.on_missing_fields = policy;
        self
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub stage: StageKind,
    /// Distinct records in the input.
    pub input_total: usize,
    /// Records already finished before this run started.
    pub already_done: usize,
    /// Records this run set out to process.
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Records left out: missing inputs, or never dispatched because of a shutdown.
    pub skipped: usize,
    /// Whether a shutdown request cut the run short.
    pub interrupted: bool,
    /// Records in the output file after the final flush.
    pub output_total: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Success: {}, Fail: {}, Skipped: {}",
            self.succeeded, self.failed, self.skipped
        )
    }
}

/// What a run would do, computed without calling the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub stage: StageKind,
    pub input_total: usize,
    pub already_done: usize,
    pub pending: usize,
    /// Pending records lacking the stage's required fields.
    pub missing_fields: usize,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} input, {} done, {} pending ({} missing required fields)",
            self.stage, self.input_total, self.already_done, self.pending, self.missing_fields
        )
    }
}

/// Runs stages against the inference service.
pub struct Engine {
    config: EngineConfig,
    gateway: Arc<Gateway>,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: EngineConfig, gateway: Arc<Gateway>) -> Self {
        Self {
            config,
            gateway,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned shutdown flag, e.g. one set by a signal handler.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Ask an in-flight run to stop dispatching and flush what it has.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Count input, finished and pending records for `job`.
    pub fn status(&self, job: &StageJob) -> PipelineResult<StageStatus> {
        let stage = job.kind.build();
        let work = store::load_pending_with(&job.input, &job.output, &job.id_field, |r| {
            stage.is_complete(r)
        })?;
        let lacking = work
            .pending
            .iter()
            .filter(|r| !stage.missing_inputs(r).is_empty())
            .count();
        Ok(StageStatus {
            stage: job.kind,
            input_total: work.input_total,
            already_done: work.already_done.len(),
            pending: work.pending.len(),
            missing_fields: lacking,
        })
    }

    /// Process every pending record of `job` once.
    ///
    /// Per-record failures are counted and logged; the record stays pending
    /// for the next run. The run itself fails only when the input is missing,
    /// no backend is configured, or the checkpoint cannot be written.
    pub fn run(&self, job: &StageJob) -> PipelineResult<RunSummary> {
        let stage = job.kind.build();
        let work = store::load_pending_with(&job.input, &job.output, &job.id_field, |r| {
            stage.is_complete(r)
        })?;

        let pending = work.pending.len();
        tracing::info!(
            stage = %job.kind,
            input = %job.input.display(),
            output = %job.output.display(),
            total = work.input_total,
            done = work.already_done.len(),
            pending,
            "stage starting"
        );

        let mut summary = RunSummary {
            stage: job.kind,
            input_total: work.input_total,
            already_done: work.already_done.len(),
            pending,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            interrupted: false,
            output_total: work.existing.len(),
        };

        let writer = CheckpointWriter::new(&job.output, job.format).with_retry(self.config.retry.clone());
        let mut existing = work.existing;

        if pending == 0 {
            // A swapped-in temp checkpoint still needs to reach the main file.
            if store::temp_path(&job.output).exists() {
                writer.flush(&existing)?;
            }
            tracing::info!(stage = %job.kind, "nothing to do");
            return Ok(summary);
        }
        if self.gateway.backend_count() == 0 {
            return Err(GatewayError::NoBackends.into());
        }

        let pool = WorkerPool::new(self.config.workers, Arc::clone(&self.shutdown))?;
        let reporter = ProgressReporter::spawn(stage.name(), pending, self.config.show_progress);
        let result = self.dispatch(
            job,
            stage.as_ref(),
            &pool,
            &reporter,
            work.pending,
            &writer,
            &mut existing,
            &mut summary,
        );
        let tally = reporter.finish();
        result?;

        tracing::debug!(?tally, "progress consumer finished");
        summary.output_total = existing.len();
        tracing::info!(
            stage = %job.kind,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            interrupted = summary.interrupted,
            "stage finished"
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        job: &StageJob,
        stage: &dyn Stage,
        pool: &WorkerPool,
        reporter: &ProgressReporter,
        mut remaining: Vec<Record>,
        writer: &CheckpointWriter,
        existing: &mut CheckpointSet,
        summary: &mut RunSummary,
    ) -> PipelineResult<()> {
        let ctx = StageContext {
            gateway: self.gateway.as_ref(),
            retry: &self.config.retry,
            model: &job.model,
            temperature: job.temperature,
        };
        let handler = |record: &Record| -> Result<Record, HandlerError> {
            let missing = stage.missing_inputs(record);
            if !missing.is_empty() {
                let fields = missing.join(", ");
                return match job.on_missing_fields {
                    MissingFieldPolicy::Skip => Err(HandlerError::Skipped(format!("missing {fields}"))),
                    MissingFieldPolicy::Fail => Err(StageError::MissingFields {
                        id: record.id().to_string(),
                        fields,
                    }
                    .into()),
                };
            }
            Ok(stage.process(record, &ctx)?)
        };

        let chunk_size = match self.config.batch_size {
            0 => remaining.len().max(1),
            n => n,
        };
        let sender = reporter.sender();
        let mut flushed = false;

        while !remaining.is_empty() {
            if pool.is_shutting_down() {
                summary.interrupted = true;
                break;
            }
            let rest = remaining.split_off(chunk_size.min(remaining.len()));
            let chunk = std::mem::replace(&mut remaining, rest);
            let order: HashMap<RecordId, usize> = chunk
                .iter()
                .enumerate()
                .map(|(i, r)| (r.id().clone(), i))
                .collect();

            // Finished records plus the saved progress of unfinished ones.
            let mut to_merge = Vec::new();
            for outcome in pool.run(chunk, &handler, &sender) {
                match outcome {
                    Outcome::Completed(record) => {
                        summary.succeeded += 1;
                        to_merge.push(record);
                    }
                    Outcome::Failed { partial, .. } => {
                        summary.failed += 1;
                        to_merge.extend(partial);
                    }
                    Outcome::Skipped { .. } => summary.skipped += 1,
                }
            }

            // Workers finish in any order; the file keeps input order per chunk.
            to_merge.sort_by_key(|r| order.get(r.id()).copied().unwrap_or(usize::MAX));
            if !to_merge.is_empty() {
                existing.extend(to_merge);
                writer.flush(existing)?;
                flushed = true;
            }
        }

        if !remaining.is_empty() {
            tracing::warn!(stage = %job.kind, undispatched = remaining.len(), "shutdown requested, stopping early");
            summary.skipped += remaining.len();
        }
        if pool.is_shutting_down() {
            summary.interrupted = true;
        }
        if !flushed && store::temp_path(writer.path()).exists() {
            writer.flush(existing)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("gateway", &self.gateway)
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}
