//! Retry policy and backoff
//!
//! `RetryPolicy` bounds a conflict-retry loop by attempt count and/or wall
//! clock. The default policy is unbounded with no delay: conflicts in the
//! store are transient and a retry loop is expected to make progress.
//!
//! ```
//! use cachestore_concurrency::RetryPolicy;
//!
//! let policy = RetryPolicy::unbounded().with_max_attempts(5);
//! assert_eq!(policy.max_attempts, Some(5));
//! ```

use cachestore_core::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

// ============================================================================
// Backoff
// ============================================================================

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the second attempt, in milliseconds (0 disables sleeping)
    pub initial_ms: u64,
    /// Upper bound on any single delay, in milliseconds
    pub max_ms: u64,
    /// Randomize each delay within `[delay / 2, delay]`
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::none()
    }
}

impl Backoff {
    /// No delay between attempts
    pub fn none() -> Self {
        Self {
            initial_ms: 0,
            max_ms: 0,
            jitter: false,
        }
    }

    /// Exponential backoff from `initial_ms` up to `max_ms`, with jitter
    pub fn exponential(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_ms,
            max_ms,
            jitter: true,
        }
    }

    /// Delay after `failures` consecutive failed attempts (1-based)
    pub fn delay(&self, failures: usize) -> Duration {
        if self.initial_ms == 0 || failures == 0 {
            return Duration::ZERO;
        }
        // Cap the shift to prevent overflow
        let shift = (failures - 1).min(63) as u32;
        let delay_ms = self
            .initial_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_ms.max(self.initial_ms));
        let delay_ms = if self.jitter && delay_ms > 1 {
            rand::thread_rng().gen_range(delay_ms / 2..=delay_ms)
        } else {
            delay_ms
        };
        Duration::from_millis(delay_ms)
    }

    /// Sleep for `delay(failures)`
    pub fn wait(&self, failures: usize) {
        let delay = self.delay(failures);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Bounds for a conflict-retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (None = unbounded)
    pub max_attempts: Option<usize>,
    /// Maximum wall-clock time across all attempts, in milliseconds
    pub max_elapsed_ms: Option<u64>,
    /// Delay between attempts
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    /// Retry forever without delay
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            max_elapsed_ms: None,
            backoff: Backoff::none(),
        }
    }

    /// Try exactly once
    pub fn no_retry() -> Self {
        Self::unbounded().with_max_attempts(1)
    }

    /// Set maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set maximum elapsed time
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed_ms = Some(max_elapsed.as_millis() as u64);
        self
    }

    /// Set backoff between attempts
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether the policy bounds the loop at all
    pub fn is_bounded(&self) -> bool {
        self.max_attempts.is_some() || self.max_elapsed_ms.is_some()
    }

    /// Start tracking one retry loop
    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            attempts: 0,
            started: Instant::now(),
        }
    }
}

/// Progress of one retry loop
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: usize,
    started: Instant,
}

impl RetryState {
    /// Attempts made so far
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Record a failed attempt
    ///
    /// Sleeps for the backoff delay and returns `Ok(())` when another
    /// attempt is allowed.
    ///
    /// # Errors
    /// Returns `Error::RetryLimitExceeded` wrapping `err` when the policy
    /// is exhausted.
    pub fn record_failure(&mut self, err: Error) -> Result<()> {
        self.attempts += 1;
        let attempts_exhausted = self
            .policy
            .max_attempts
            .map_or(false, |max| self.attempts >= max);
        let time_exhausted = self
            .policy
            .max_elapsed_ms
            .map_or(false, |max| self.started.elapsed() >= Duration::from_millis(max));
        if attempts_exhausted || time_exhausted {
            return Err(Error::RetryLimitExceeded {
                attempts: self.attempts,
                last: Box::new(err),
            });
        }
        debug!(
            target: "cachestore::txn",
            attempt = self.attempts,
            error = %err,
            "Retrying after conflict"
        );
        self.policy.backoff.wait(self.attempts);
        Ok(())
    }
}
