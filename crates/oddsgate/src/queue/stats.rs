//! Queue observability snapshots.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::job::JobKind;

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    /// Mean time between enqueue and first dispatch.
    pub average_wait_ms: f64,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub running: bool,
    pub pending: usize,
    /// Pending jobs whose `ready_at` has passed.
    pub ready: usize,
    /// Pending jobs held back by a retry delay.
    pub delayed: usize,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub pending_by_kind: BTreeMap<JobKind, usize>,
    pub stats: QueueStats,
}

#[derive(Debug, Default)]
pub(super) struct Counters {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub total_wait: Duration,
    pub waits: u64,
}

impl Counters {
    pub fn snapshot(&self) -> QueueStats {
        let average_wait_ms = if self.waits == 0 {
            0.0
        } else {
            self.total_wait.as_secs_f64() * 1000.0 / self.waits as f64
        };
        QueueStats {
            total_enqueued: self.enqueued,
            total_processed: self.processed,
            total_failed: self.failed,
            total_retried: self.retried,
            average_wait_ms,
        }
    }
}
