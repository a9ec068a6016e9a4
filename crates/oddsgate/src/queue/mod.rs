//! In-memory priority job queue with bounded concurrency.
//!
//! Jobs are ordered by priority (lower first) and enqueue order. A single
//! scheduler task pops the best *ready* job while fewer than
//! `max_concurrent` processors are running and spawns the processor without
//! waiting on it. Failed jobs go back into the queue with an exponential
//! backoff `ready_at` until they run out of attempts.

mod config;
mod processor;
mod stats;

pub use config::QueueConfig;
pub use processor::{FnProcessor, JobProcessor};
pub use stats::{QueueStats, QueueStatus};

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::error::{GatewayError, QueueError};
use crate::job::{Job, JobEvent, JobId, JobKind, JobSpec};
use crate::retry::RetryPolicy;
use stats::Counters;

/// Ordering key: priority, then enqueue sequence.
type QueueKey = (i32, u64);

struct QueueInner {
    config: QueueConfig,
    retry: RetryPolicy,
    clock: SharedClock,
    pending: Mutex<BTreeMap<QueueKey, Job>>,
    processors: RwLock<HashMap<JobKind, Arc<dyn JobProcessor>>>,
    in_flight: AtomicUsize,
    sequence: AtomicU64,
    counters: Mutex<Counters>,
    running: AtomicBool,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<JobEvent>,
}

/// Releases a concurrency slot when a processor finishes, even by panic.
struct InFlightGuard {
    inner: Arc<QueueInner>,
    /// Wake the scheduler on release. Off for slots that were never used.
    notify: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.notify {
            self.inner.wake.notify_one();
        }
    }
}

impl QueueInner {
    fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Reserve a concurrency slot if one is free.
    fn claim_slot(self: &Arc<Self>) -> Option<InFlightGuard> {
        let max = self.config.max_concurrent;
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| InFlightGuard {
                inner: Arc::clone(self),
                notify: true,
            })
    }

    /// Dispatch ready jobs while slots are free.
    ///
    /// Returns the earliest `ready_at` among jobs still waiting on a delay, so
    /// the scheduler knows when to look again. `None` means "wait for a wake".
    fn dispatch_ready(self: &Arc<Self>) -> Option<Instant> {
        loop {
            let Some(mut slot) = self.claim_slot() else {
                return None;
            };

            let now = self.clock.now();
            let job = {
                let mut pending = self.pending.lock();
                let key = pending
                    .iter()
                    .find(|(_, job)| job.is_ready(now))
                    .map(|(key, _)| *key);
                match key.and_then(|key| pending.remove(&key)) {
                    Some(job) => job,
                    None => {
                        slot.notify = false;
                        return pending.values().map(|job| job.ready_at).min();
                    }
                }
            };

            self.dispatch(job, now, slot);
        }
    }

    fn dispatch(self: &Arc<Self>, job: Job, now: Instant, slot: InFlightGuard) {
        let processor = self.processors.read().get(&job.kind()).cloned();
        let Some(processor) = processor else {
            error!(
                "No processor registered for {} (job {}), dropping it",
                job.kind(),
                job.id
            );
            self.counters.lock().failed += 1;
            self.publish(JobEvent::Failed {
                id: job.id,
                kind: job.kind(),
                attempts: job.attempt,
                error: QueueError::NoProcessor(job.kind()).to_string(),
            });
            return;
        };

        let waited = now.saturating_duration_since(job.created_at);
        if job.attempt == 0 {
            let mut counters = self.counters.lock();
            counters.total_wait += waited;
            counters.waits += 1;
        }

        debug!(
            "Dispatching job {} ({}) attempt {}/{}",
            job.id,
            job.payload,
            job.attempt + 1,
            job.max_attempts
        );
        self.publish(JobEvent::Dispatched {
            id: job.id,
            kind: job.kind(),
            attempt: job.attempt + 1,
            waited,
        });

        tokio::spawn(async move {
            let result = processor.process(&job).await;
            slot.inner.finish(job, result);
            drop(slot);
        });
    }

    /// Record the outcome of one attempt.
    fn finish(&self, mut job: Job, result: Result<(), GatewayError>) {
        let error = match result {
            Ok(()) => {
                self.counters.lock().processed += 1;
                debug!("Job {} ({}) completed", job.id, job.payload);
                self.publish(JobEvent::Completed {
                    id: job.id,
                    kind: job.kind(),
                    attempts: job.attempt + 1,
                });
                return;
            }
            Err(error) => error,
        };

        job.attempt += 1;

        if error.is_retryable() && job.attempt < job.max_attempts {
            let delay = self.retry.delay_for(job.attempt);
            job.ready_at = self.clock.now() + delay;
            debug!(
                "Job {} ({}) failed attempt {}: {}; retrying in {:?}",
                job.id, job.payload, job.attempt, error, delay
            );
            self.counters.lock().retried += 1;
            self.publish(JobEvent::Retrying {
                id: job.id,
                kind: job.kind(),
                attempt: job.attempt,
                delay,
                error: error.to_string(),
            });
            self.pending.lock().insert((job.priority, job.sequence), job);
            self.wake.notify_one();
            return;
        }

        warn!(
            "Job {} ({}) failed after {} attempt(s): {}",
            job.id, job.payload, job.attempt, error
        );
        self.counters.lock().failed += 1;
        self.publish(JobEvent::Failed {
            id: job.id,
            kind: job.kind(),
            attempts: job.attempt,
            error: error.to_string(),
        });
    }
}

async fn run_scheduler(inner: Arc<QueueInner>, mut shutdown: watch::Receiver<bool>) {
    info!(
        "Job queue scheduler started (max {} concurrent)",
        inner.config.max_concurrent
    );

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let wait = match inner.dispatch_ready() {
            Some(next_ready) => next_ready
                .saturating_duration_since(inner.clock.now())
                .min(inner.config.poll_interval),
            None => inner.config.poll_interval,
        };

        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {}
        }
    }

    info!("Job queue scheduler stopped");
}

/// Priority job queue.
///
/// Construct with `new`, register processors, then `start` the scheduler.
pub struct JobQueue {
    inner: Arc<QueueInner>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(config: QueueConfig, clock: SharedClock) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(QueueInner {
                retry: config.retry_policy(),
                config,
                clock,
                pending: Mutex::new(BTreeMap::new()),
                processors: RwLock::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                sequence: AtomicU64::new(0),
                counters: Mutex::new(Counters::default()),
                running: AtomicBool::new(false),
                wake: Notify::new(),
                shutdown,
                events,
            }),
            scheduler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Bind a processor to a job kind.
    ///
    /// Registering the same kind again replaces the earlier processor.
    pub fn register_processor(&self, kind: JobKind, processor: Arc<dyn JobProcessor>) {
        if self
            .inner
            .processors
            .write()
            .insert(kind, processor)
            .is_some()
        {
            debug!("Replaced processor for {}", kind);
        }
    }

    /// Register an async closure as the processor for `kind`.
    pub fn register_fn<F, Fut>(&self, kind: JobKind, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.register_processor(kind, Arc::new(FnProcessor::new(f)));
    }

    pub fn has_processor(&self, kind: JobKind) -> bool {
        self.inner.processors.read().contains_key(&kind)
    }

    /// Add a job. Fails without touching the queue if it is full.
    pub fn enqueue(&self, spec: impl Into<JobSpec>) -> Result<JobId, QueueError> {
        let spec = spec.into();
        let kind = spec.payload.kind();
        if !self.has_processor(kind) {
            error!("Enqueue of {} with no registered processor", kind);
            return Err(QueueError::NoProcessor(kind));
        }

        let config = &self.inner.config;
        let now = self.inner.clock.now();
        let priority = spec.priority.unwrap_or(config.default_priority);

        let id = {
            let mut pending = self.inner.pending.lock();
            if pending.len() >= config.max_queue_size {
                warn!(
                    "Queue full ({} pending), rejecting {}",
                    pending.len(),
                    spec.payload
                );
                return Err(QueueError::QueueFull {
                    capacity: config.max_queue_size,
                });
            }

            let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
            let job = Job {
                id: JobId::new(),
                payload: spec.payload,
                priority,
                attempt: 0,
                max_attempts: spec
                    .max_attempts
                    .unwrap_or(config.default_max_attempts)
                    .max(1),
                created_at: now,
                ready_at: now + spec.delay.unwrap_or_default(),
                enqueued_at: Utc::now(),
                sequence,
            };
            let id = job.id;
            pending.insert((priority, sequence), job);
            id
        };

        self.inner.counters.lock().enqueued += 1;
        self.inner.publish(JobEvent::Enqueued { id, kind, priority });
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Spawn the scheduler. No-op if it is already running.
    pub fn start(&self) {
        let mut scheduler = self.scheduler.lock();
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(previous) = scheduler.take() {
            previous.abort();
        }
        self.inner.shutdown.send_replace(false);
        let receiver = self.inner.shutdown.subscribe();
        *scheduler = Some(tokio::spawn(run_scheduler(
            Arc::clone(&self.inner),
            receiver,
        )));
    }

    /// Stop dispatching. Running processors finish on their own.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.inner.shutdown.send_replace(true);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Drop every pending job. Running processors are not affected.
    pub fn clear(&self) -> usize {
        let mut pending = self.inner.pending.lock();
        let dropped = pending.len();
        pending.clear();
        if dropped > 0 {
            info!("Cleared {} pending job(s)", dropped);
        }
        dropped
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Wait until nothing is pending or running.
    ///
    /// Only returns once delayed retries have run too, so call it while the
    /// scheduler is running.
    pub async fn wait_idle(&self) {
        while self.pending() > 0 || self.in_flight() > 0 {
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    /// Stop the scheduler; with `drain`, also wait for running processors.
    pub async fn shutdown(&self, drain: bool) {
        self.stop();
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Job queue scheduler ended abnormally: {}", e);
            }
        }
        if drain {
            while self.in_flight() > 0 {
                tokio::time::sleep(self.inner.config.poll_interval).await;
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.counters.lock().snapshot()
    }

    pub fn status(&self) -> QueueStatus {
        let now = self.inner.clock.now();
        let (pending, ready, pending_by_kind) = {
            let pending = self.inner.pending.lock();
            let mut by_kind = BTreeMap::new();
            let mut ready = 0;
            for job in pending.values() {
                *by_kind.entry(job.kind()).or_insert(0) += 1;
                if job.is_ready(now) {
                    ready += 1;
                }
            }
            (pending.len(), ready, by_kind)
        };

        QueueStatus {
            running: self.is_running(),
            pending,
            ready,
            delayed: pending - ready,
            in_flight: self.in_flight(),
            max_concurrent: self.inner.config.max_concurrent,
            max_queue_size: self.inner.config.max_queue_size,
            pending_by_kind,
            stats: self.stats(),
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}
