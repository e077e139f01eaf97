//! Retry / Failure Manager (spec.md section 4.7): error classification and
//! bounded exponential backoff. Pure logic — no I/O — so the Task Executor
//! and Janitor share one source of truth for "should this be retried, and
//! after how long".

use crate::model::ErrorCategory;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// `delay = min(base * 2^retry_count, max_delay)`.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exp = 2u64.saturating_pow(retry_count.max(0) as u32);
        let scaled = self.base_delay.saturating_mul(exp.min(u32::MAX as u64) as u32);
        scaled.min(self.max_delay)
    }

    pub fn exhausted(&self, retry_count: i32) -> bool {
        retry_count >= self.max_retries
    }
}

/// Whether a task that just failed with `category` should be retried given
/// its current `retry_count` under `policy`. Contract violations and
/// business errors are never retried regardless of count (spec.md 4.7).
pub fn should_retry(category: ErrorCategory, retry_count: i32, policy: &RetryPolicy) -> bool {
    match category {
        ErrorCategory::ContractViolation | ErrorCategory::Business => false,
        ErrorCategory::Transient => !policy.exhausted(retry_count),
        // Unclassified: transient on first occurrence, permanent thereafter.
        ErrorCategory::Unclassified => retry_count == 0,
    }
}
