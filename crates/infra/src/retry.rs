//! Retry policy for failed deliveries.

use std::time::Duration;

use crate::broker::{FieldTable, FieldValue};

/// Header carrying how many times a message has been retried.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Exponential backoff, no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries before a message is dead-lettered (0 = dead-letter on first failure).
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Optional cap on a single delay.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: None,
        }
    }
}

/// What to do with a delivery whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish with `x-retry-count = attempt` after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Reject without requeue.
    DeadLetter,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay before the `attempt`-th retry (1-indexed): `2^(attempt-1) * base`.
    ///
    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn delay_for_retry(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = 1u32
            .checked_shl(attempt - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Decide based on the retry count the failed delivery carried.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retries {
            let attempt = retry_count + 1;
            RetryDecision::Retry {
                attempt,
                delay: self.delay_for_retry(attempt),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }
}

/// Read `x-retry-count` from message headers; absent or unreadable is 0.
pub fn retry_count(headers: &FieldTable) -> u32 {
    headers
        .get(RETRY_COUNT_HEADER)
        .and_then(FieldValue::as_i64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}
