//! Processor contract for queued jobs.

use std::future::Future;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::job::Job;

/// Handles every job of one `JobKind`.
///
/// An `Err` that is retryable sends the job back to the queue with backoff;
/// anything else fails it for good.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<(), GatewayError>;
}

/// Adapts an async closure into a `JobProcessor`.
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
{
    async fn process(&self, job: &Job) -> Result<(), GatewayError> {
        (self.f)(job.clone()).await
    }
}
