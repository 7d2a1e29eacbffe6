//! Bounded worker pool.
//!
//! Records are spawned onto a dedicated `rayon` pool in input order
//! (`spawn_fifo`); they finish in whatever order the service answers. Each
//! job checks the shutdown flag before it starts, so an interrupt stops new
//! dispatch while in-flight calls run to completion.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{ConfigError, StageError};
use crate::progress::{ProgressEvent, ProgressSender};
use crate::record::{Record, RecordId};

/// Result of handling one record.
#[derive(Debug)]
pub enum Outcome {
    Completed(Record),
    /// `partial` holds progress worth checkpointing even though the record
    /// is not finished.
    Failed {
        id: RecordId,
        error: String,
        partial: Option<Record>,
    },
    Skipped { id: RecordId, reason: String },
}

impl Outcome {
    pub fn id(&self) -> &RecordId {
        match self {
            Outcome::Completed(r) => r.id(),
            Outcome::Failed { id, .. } | Outcome::Skipped { id, .. } => id,
        }
    }

    fn event(&self) -> ProgressEvent {
        match self {
            Outcome::Completed(r) => ProgressEvent::Succeeded(r.id().clone()),
            Outcome::Failed { id, error, .. } => ProgressEvent::Failed(id.clone(), error.clone()),
            Outcome::Skipped { id, .. } => ProgressEvent::Skipped(id.clone()),
        }
    }
}

/// What a handler may say about a record besides success.
#[derive(Debug)]
pub enum HandlerError {
    /// Counted as a failure; the record stays pending.
    Failed(StageError),
    /// Not attempted; the record stays pending without counting as a failure.
    Skipped(String),
}

impl From<StageError> for HandlerError {
    fn from(e: StageError) -> Self {
        HandlerError::Failed(e)
    }
}

/// Fixed-size thread pool plus the shared shutdown flag.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(workers: usize, shutdown: Arc<AtomicBool>) -> Result<Self, ConfigError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("synth-worker-{i}"))
            .build()
            .map_err(|e| ConfigError::Invalid {
                message: format!("failed to build worker pool: {e}"),
            })?;
        Ok(Self { pool, shutdown })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run `handler` over `records`, one job per record.
    ///
    /// Outcomes come back in completion order. A failing or panicking handler
    /// only affects its own record.
    pub fn run<H>(&self, records: Vec<Record>, handler: &H, progress: &ProgressSender) -> Vec<Outcome>
    where
        H: Fn(&Record) -> Result<Record, HandlerError> + Sync,
    {
        let outcomes = Mutex::new(Vec::with_capacity(records.len()));
        let shutdown = &self.shutdown;
        let outcomes_ref = &outcomes;

        self.pool.scope_fifo(|scope| {
            for record in records {
                let progress = progress.clone();
                scope.spawn_fifo(move |_| {
                    let outcome = if shutdown.load(Ordering::SeqCst) {
                        Outcome::Skipped {
                            id: record.id().clone(),
                            reason: "interrupted before dispatch".into(),
                        }
                    } else {
                        handle_one(&record, handler)
                    };
                    progress.emit(outcome.event());
                    if let Ok(mut guard) = outcomes_ref.lock() {
                        guard.push(outcome);
                    }
                });
            }
        });

        outcomes.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn handle_one<H>(record: &Record, handler: &H) -> Outcome
where
    H: Fn(&Record) -> Result<Record, HandlerError>,
{
    let id = record.id().clone();
    match catch_unwind(AssertUnwindSafe(|| handler(record))) {
        Ok(Ok(done)) if done.id() == &id => Outcome::Completed(done),
        Ok(Ok(done)) => Outcome::Failed {
            error: format!("handler returned a record with a different id ({})", done.id()),
            id,
            partial: None,
        },
        Ok(Err(HandlerError::Failed(e))) => {
            let (cause, partial) = e.into_parts();
            let partial = partial.filter(|p| p.id() == &id);
            tracing::warn!(id = %id, error = %cause, saved_partial = partial.is_some(), "record failed");
            Outcome::Failed {
                id,
                error: cause.to_string(),
                partial,
            }
        }
        Ok(Err(HandlerError::Skipped(reason))) => {
            tracing::info!(id = %id, reason = %reason, "record skipped");
            Outcome::Skipped { id, reason }
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".into());
            tracing::error!(id = %id, panic = %message, "record handler panicked");
            Outcome::Failed {
                id,
                error: message,
                partial: None,
            }
        }
    }
}
