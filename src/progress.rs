//! Live progress: one consumer thread draining worker events.
//!
//! Workers hold a cloneable [`ProgressSender`] and emit without blocking. The
//! consumer owns all tallies and the terminal bar, and stops at the
//! [`ProgressEvent::Finished`] sentinel.

use std::sync::mpsc;
use std::thread::JoinHandle;

use indicatif::{ProgressBar, ProgressStyle};

use crate::record::RecordId;

/// What a worker reports about one record.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Succeeded(RecordId),
    Failed(RecordId, String),
    /// Not dispatched: interrupted, or missing inputs under the skip policy.
    Skipped(RecordId),
    /// Sentinel: no more events follow.
    Finished,
}

/// Final counts, returned when the consumer exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressTally {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ProgressTally {
    pub fn observe(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Succeeded(_) => self.succeeded += 1,
            ProgressEvent::Failed(..) => self.failed += 1,
            ProgressEvent::Skipped(_) => self.skipped += 1,
            ProgressEvent::Finished => {}
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Cheap handle used by workers.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    /// Queue an event. Never blocks; a gone consumer is ignored.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Owner of the consumer thread.
pub struct ProgressReporter {
    sender: ProgressSender,
    handle: JoinHandle<ProgressTally>,
}

impl ProgressReporter {
    /// Start the consumer. With `visible = false` nothing is drawn, which is
    /// what tests and `--quiet` runs use.
    pub fn spawn(label: &str, total: usize, visible: bool) -> Self {
        let (tx, rx) = mpsc::channel();
        let bar = if visible {
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
            );
            bar
        } else {
            ProgressBar::hidden()
        };
        bar.set_prefix(label.to_string());

        let handle = std::thread::spawn(move || consume(rx, bar));
        Self {
            sender: ProgressSender { tx },
            handle,
        }
    }

    pub fn sender(&self) -> ProgressSender {
        self.sender.clone()
    }

    /// Send the sentinel and wait for the consumer's tallies.
    pub fn finish(self) -> ProgressTally {
        self.sender.emit(ProgressEvent::Finished);
        drop(self.sender);
        self.handle.join().unwrap_or_default()
    }
}

fn consume(rx: mpsc::Receiver<ProgressEvent>, bar: ProgressBar) -> ProgressTally {
    let mut tally = ProgressTally::default();
    // Also ends if every sender is dropped without a sentinel.
    for event in rx {
        if event == ProgressEvent::Finished {
            break;
        }
        tally.observe(&event);
        if let ProgressEvent::Failed(id, message) = &event {
            bar.println(format!("{} failed: {message}", id));
        }
        bar.set_message(format!(
            "(Success: {}, Fail: {})",
            tally.succeeded, tally.failed
        ));
        bar.inc(1);
    }
    bar.finish();
    tally
}
