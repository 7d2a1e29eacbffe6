//! Round-robin selection over interchangeable backends.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread-safe rotation over `len` slots.
///
/// `next()` hands out `0, 1, ..., len-1, 0, ...` across all callers; the
/// counter is the only shared state and is advanced atomically.
#[derive(Debug)]
pub struct Rotation {
    len: usize,
    counter: AtomicUsize,
}

impl Rotation {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            counter: AtomicUsize::new(0),
        }
    }

    /// Next slot, or `None` when there is nothing to rotate over.
    pub fn next(&self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % self.len)
    }
}
