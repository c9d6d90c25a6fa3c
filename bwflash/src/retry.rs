//! Bounded retry with deterministic backoff.
//!
//! Every request/response exchange in a session goes through one
//! [`RetryPolicy`]. Only transient wire-level errors (timeouts, framing
//! errors, checksum mismatches) are retried; fatal errors pass through
//! on first occurrence. Backoff is a pure function of the attempt
//! index, so behavior is reproducible in tests.

use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};

/// Retry configuration shared by all exchanges within a session.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts per exchange.
    pub max_attempts: u32,
    /// Response deadline per attempt.
    pub timeout: Duration,
    /// Backoff unit; attempt `n` sleeps `n * base_backoff` before retrying.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            timeout: Duration::from_secs(2),
            base_backoff: Duration::from_millis(60),
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting, for tests and simulation.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            timeout: Duration::ZERO,
            base_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based, pure).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * attempt
    }

    /// Run `op` up to `max_attempts` times.
    ///
    /// `op` receives the 1-based attempt number. Returns the first
    /// success, the first non-retryable error, or the last retryable
    /// error after the bound is exhausted.
    pub fn attempt<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut last = None;
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                thread::sleep(self.backoff(attempt - 1));
            }
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    debug!("attempt {attempt}/{} failed: {e}", self.max_attempts);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| Error::Timeout("retry policy allows no attempts".into())))
    }
}
