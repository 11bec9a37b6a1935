//! Bounded retry for hardware connection establishment.

use std::fmt;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Fixed number of attempts with a fixed delay between them.
///
/// Only used while a hardware backend is being constructed. Per-call
/// encrypt/decrypt failures are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    /// Pause between attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay_ms: 1_000,
        }
    }
}

/// Returned when every attempt failed. Carries the last error seen.
#[derive(Debug)]
pub struct RetriesExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number. The calling thread sleeps
    /// between attempts; there is no sleep after the final failure.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> Result<T, RetriesExhausted<E>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => {
                    error!(operation = what, attempts, error = %err, "retries exhausted");
                    return Err(RetriesExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(err) => {
                    warn!(operation = what, attempt, of = attempts, error = %err, "attempt failed, retrying");
                    thread::sleep(self.delay());
                    attempt += 1;
                }
            }
        }
    }
}
