//! Bounded retry with delay.
//!
//! [`RetryPolicy::run`] is a plain loop: attempt, and on failure sleep and try
//! again until `max_attempts` is reached. The caller gets either the first
//! success or an [`Exhausted`] carrying the last error.

use std::time::Duration;

use rand::Rng;

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Pause before the second attempt.
    pub delay: Duration,
    /// Multiplier applied to the pause after each failure. `1.0` is a fixed delay.
    pub backoff: f64,
    /// Upper bound for the pause.
    pub max_delay: Duration,
    /// Random extra pause in `0..=jitter`, spreading retries across workers.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            backoff: 1.0,
            max_delay: Duration::from_secs(30),
            jitter: Duration::ZERO,
        }
    }
}

/// All attempts failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    /// A policy that retries without sleeping. Useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
            backoff: 1.0,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Pause after the `failed`-th consecutive failure (1-based).
    pub fn delay_after(&self, failed: u32) -> Duration {
        let cap = self.max_delay.max(self.delay);
        let exponent = i32::try_from(failed.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff.max(1.0).powi(exponent);
        // Compared in f64 first: a large backoff overflows `Duration` long before the cap.
        let scaled = self.delay.as_secs_f64() * factor;
        let base = if scaled.is_finite() && scaled < cap.as_secs_f64() {
            Duration::try_from_secs_f64(scaled).unwrap_or(cap)
        } else {
            cap
        };
        if self.jitter.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(extra)
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, mut op: F) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: std::fmt::Display,
    {
        let max = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max => {
                    return Err(Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let pause = self.delay_after(attempt);
                    tracing::debug!(attempt, max, error = %e, pause_ms = pause.as_millis() as u64, "attempt failed, retrying");
                    if !pause.is_zero() {
                        std::thread::sleep(pause);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
