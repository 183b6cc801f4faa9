//! Bounded retry with exponential backoff for store writes.
//!
//! Only transient failures (busy, locked, timed out) are retried. Closes get
//! more attempts than opens: a lost close loses credited time, a lost open
//! is recovered by the next member update.

use std::thread;
use std::time::Duration;

use crate::store::StoreError;

const CLOSE_ATTEMPTS: u32 = 5;
const OPEN_ATTEMPTS: u32 = 2;
const INITIAL_DELAY_MS: u64 = 50;
const BACKOFF_FACTOR: u32 = 2;
const MAX_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub close_attempts: u32,
    pub open_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            close_attempts: CLOSE_ATTEMPTS,
            open_attempts: OPEN_ATTEMPTS,
            initial_delay: Duration::from_millis(INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without sleeping. Used by tests.
    pub const fn immediate(close_attempts: u32, open_attempts: u32) -> Self {
        Self {
            close_attempts,
            open_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = BACKOFF_FACTOR.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    pub fn run_close<T>(
        &self,
        what: &str,
        op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.run(what, self.close_attempts, op)
    }

    pub fn run_open<T>(
        &self,
        what: &str,
        op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.run(what, self.open_attempts, op)
    }

    fn run<T>(
        &self,
        what: &str,
        attempts: u32,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        operation = what,
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient store failure, retrying"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::warn!(
                            operation = what,
                            attempts,
                            error = %err,
                            "store retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
