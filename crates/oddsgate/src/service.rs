//! Composition root: one limiter, one gateway and one queue per process.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::clock::{SharedClock, TokioClock};
use crate::config::Settings;
use crate::error::{ConfigError, GatewayError, QueueError, UpstreamError};
use crate::gateway::{ApiGateway, CallResult, CallStats};
use crate::job::{Job, JobEvent, JobId, JobKind, JobPayload, JobSpec};
use crate::queue::{JobProcessor, JobQueue, QueueStatus};
use crate::rate_limit::{EndpointLimits, EndpointStatus, RateLimiter};
use crate::retry::RetryConfigUpdate;
use crate::upstream::{ResultSink, TracingSink, Upstream, UpstreamClient};

/// Fetch `payload` through the gateway, using its kind as the endpoint key.
async fn fetch_through(
    gateway: &ApiGateway,
    upstream: &dyn Upstream,
    payload: &JobPayload,
) -> CallResult<Value> {
    let kind = payload.kind();
    gateway
        .call(kind.as_str(), kind, move || upstream.fetch(payload))
        .await
}

/// Queue processor shared by every job kind.
struct FeedProcessor {
    gateway: Arc<ApiGateway>,
    upstream: Arc<dyn Upstream>,
    sink: Arc<dyn ResultSink>,
}

#[async_trait]
impl JobProcessor for FeedProcessor {
    async fn process(&self, job: &Job) -> Result<(), GatewayError> {
        let data = fetch_through(&self.gateway, self.upstream.as_ref(), &job.payload)
            .await
            .into_result()?;
        self.sink.publish(&job.payload, data).await;
        Ok(())
    }
}

/// The resilience layer as seen by the rest of the platform.
pub struct FeedService {
    settings: Settings,
    gateway: Arc<ApiGateway>,
    queue: JobQueue,
    upstream: Arc<dyn Upstream>,
}

impl FeedService {
    /// Start with the HTTP upstream and a logging result sink.
    pub fn start(settings: Settings) -> Result<Self, ConfigError> {
        let upstream = Arc::new(UpstreamClient::new(&settings.upstream)?);
        Ok(Self::with_parts(
            settings,
            upstream,
            Arc::new(TracingSink),
            TokioClock::shared(),
        ))
    }

    /// Start with explicit collaborators. The queue scheduler is running on return.
    pub fn with_parts(
        settings: Settings,
        upstream: Arc<dyn Upstream>,
        sink: Arc<dyn ResultSink>,
        clock: SharedClock,
    ) -> Self {
        let limiter = RateLimiter::new(settings.default_endpoint.clone(), clock.clone());
        for (endpoint, limits) in &settings.endpoints {
            limiter.set_endpoint_config(endpoint, limits.clone());
        }

        let gateway = Arc::new(ApiGateway::new(
            limiter,
            settings.retry.clone(),
            settings.request_timeout,
        ));

        let queue = JobQueue::new(settings.queue.clone(), clock);
        let processor: Arc<dyn JobProcessor> = Arc::new(FeedProcessor {
            gateway: Arc::clone(&gateway),
            upstream: Arc::clone(&upstream),
            sink,
        });
        for kind in JobKind::all() {
            queue.register_processor(*kind, Arc::clone(&processor));
        }
        queue.start();

        info!(
            "Feed service started: {} endpoint policies, max {} concurrent jobs",
            settings.endpoints.len(),
            settings.queue.max_concurrent
        );

        Self {
            settings,
            gateway,
            queue,
            upstream,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn gateway(&self) -> &ApiGateway {
        &self.gateway
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Queue a fetch of `id` for `kind`. The result goes to the sink.
    pub fn enqueue(
        &self,
        kind: JobKind,
        id: &str,
        priority: Option<i32>,
    ) -> Result<JobId, QueueError> {
        let mut spec = JobSpec::new(JobPayload::new(kind, id));
        spec.priority = priority;
        self.queue.enqueue(spec)
    }

    pub fn enqueue_spec(&self, spec: impl Into<JobSpec>) -> Result<JobId, QueueError> {
        self.queue.enqueue(spec)
    }

    /// Direct call through the shared limiter and retry policy.
    pub async fn call<T, F, Fut>(&self, endpoint: &str, kind: JobKind, invoke: F) -> CallResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.gateway.call(endpoint, kind, invoke).await
    }

    /// Fetch a payload inline, bypassing the queue.
    pub async fn fetch_now(&self, payload: &JobPayload) -> CallResult<Value> {
        fetch_through(&self.gateway, self.upstream.as_ref(), payload).await
    }

    /// Fetch several payloads concurrently, bypassing the queue.
    ///
    /// Calls race for the shared limiter; results come back in input order.
    pub async fn fetch_many(&self, payloads: &[JobPayload]) -> Vec<CallResult<Value>> {
        join_all(payloads.iter().map(|payload| self.fetch_now(payload))).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.queue.subscribe()
    }

    pub fn stats(&self) -> CallStats {
        self.gateway.stats()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Limiter status for one endpoint, or for every endpoint used so far.
    pub fn rate_limiter_status(&self, endpoint: Option<&str>) -> BTreeMap<String, EndpointStatus> {
        let limiter = self.gateway.limiter();
        match endpoint {
            Some(endpoint) => limiter
                .status(endpoint)
                .map(|status| (endpoint.to_string(), status))
                .into_iter()
                .collect(),
            None => limiter.status_all(),
        }
    }

    /// Clear limiter state and call statistics. Queued jobs are untouched.
    pub fn reset_all(&self) {
        self.gateway.limiter().reset_all();
        self.gateway.reset_stats();
        info!("Rate limiter state and call stats reset");
    }

    pub fn update_retry_config(&self, update: &RetryConfigUpdate) {
        self.gateway.update_retry_config(update);
    }

    pub fn set_endpoint_config(&self, endpoint: &str, limits: EndpointLimits) {
        self.gateway.limiter().set_endpoint_config(endpoint, limits);
    }

    /// Stop the scheduler; with `drain`, wait for running jobs to finish.
    pub async fn shutdown(&self, drain: bool) {
        info!("Feed service shutting down (drain: {})", drain);
        self.queue.shutdown(drain).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    struct EchoUpstream;

    #[async_trait]
    impl Upstream for EchoUpstream {
        async fn fetch(&self, payload: &JobPayload) -> Result<Value, UpstreamError> {
            Ok(json!({ "kind": payload.kind().as_str(), "id": payload.resource_id() }))
        }
    }

    #[derive(Default)]
    struct VecSink(Mutex<Vec<(JobPayload, Value)>>);

    #[async_trait]
    impl ResultSink for VecSink {
        async fn publish(&self, payload: &JobPayload, data: Value) {
            self.0.lock().push((payload.clone(), data));
        }
    }

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.queue.poll_interval = Duration::from_millis(10);
        settings.retry.jitter = false;
        settings
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_now_goes_through_gateway() {
        let service = FeedService::with_parts(
            test_settings(),
            Arc::new(EchoUpstream),
            Arc::new(VecSink::default()),
            TokioClock::shared(),
        );

        let payload = JobPayload::new(JobKind::CricketScorecard, "77");
        let data = service.fetch_now(&payload).await.into_result().unwrap();
        assert_eq!(data["id"], "77");

        assert_eq!(service.stats().successful_calls, 1);
        let status = service.rate_limiter_status(Some("cricket_scorecard"));
        assert_eq!(status["cricket_scorecard"].total_requests, 1);
        assert_eq!(status["cricket_scorecard"].max_requests, 20);
        assert!(service.rate_limiter_status(Some("casino_tv")).is_empty());

        service.shutdown(true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_job_reaches_sink() {
        let sink = Arc::new(VecSink::default());
        let service = FeedService::with_parts(
            test_settings(),
            Arc::new(EchoUpstream),
            sink.clone(),
            TokioClock::shared(),
        );

        service.enqueue(JobKind::CasinoResults, "teen20", Some(1)).unwrap();
        service.queue().wait_idle().await;

        let published = sink.0.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, JobPayload::new(JobKind::CasinoResults, "teen20"));
        assert_eq!(published[0].1["kind"], "casino_results");
        assert_eq!(service.queue_status().stats.total_processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all_clears_limiter_and_stats() {
        let service = FeedService::with_parts(
            test_settings(),
            Arc::new(EchoUpstream),
            Arc::new(VecSink::default()),
            TokioClock::shared(),
        );

        service
            .fetch_now(&JobPayload::new(JobKind::CasinoData, "lucky7"))
            .await;
        assert_eq!(service.rate_limiter_status(None).len(), 1);

        service.reset_all();
        assert!(service.rate_limiter_status(None).is_empty());
        assert_eq!(service.stats(), CallStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_reconfiguration() {
        let service = FeedService::with_parts(
            test_settings(),
            Arc::new(EchoUpstream),
            Arc::new(VecSink::default()),
            TokioClock::shared(),
        );

        service.set_endpoint_config(
            "casino_tv",
            EndpointLimits {
                max_requests: 2,
                ..EndpointLimits::casino()
            },
        );
        service.update_retry_config(&RetryConfigUpdate {
            max_retries: Some(0),
            ..Default::default()
        });

        assert_eq!(service.gateway().limiter().endpoint_config("casino_tv").max_requests, 2);
        assert_eq!(service.gateway().retry_config().max_retries, 0);
    }
}
