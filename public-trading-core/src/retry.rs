//! Exponential backoff policy for transient failures.

use std::time::Duration;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

/// Default ceiling for a single backoff delay, in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Default growth factor between consecutive delays.
pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// How many times, and how patiently, a transient failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. `0` disables retrying.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Default cap and multiplier with the given retry count and first delay.
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Cap for any single delay.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// `initial_backoff * multiplier^(retry - 1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn allows_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}
