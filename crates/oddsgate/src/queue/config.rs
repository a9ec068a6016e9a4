//! Job queue configuration.

use std::time::Duration;

use crate::retry::{RetryConfig, RetryPolicy};

/// Limits and retry tuning for a `JobQueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Hard cap on simultaneously running processors.
    pub max_concurrent: usize,
    /// Enqueue fails once this many jobs are pending.
    pub max_queue_size: usize,
    /// Priority for jobs that don't set one (lower runs first).
    pub default_priority: i32,
    /// Attempts per job unless the job overrides it.
    pub default_max_attempts: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub jitter_max: Duration,
    /// Longest the scheduler sleeps without re-checking for ready jobs.
    pub poll_interval: Duration,
    /// Buffered lifecycle events per subscriber.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_queue_size: 1000,
            default_priority: 5,
            default_max_attempts: 3,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            jitter_max: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    /// Backoff policy for requeued jobs.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: self.default_max_attempts.saturating_sub(1),
            base_delay: self.base_retry_delay,
            max_delay: self.max_retry_delay,
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
            jitter_max: self.jitter_max,
        })
    }
}
