//! Rate-limited, retrying call path shared by direct callers and queue processors.

use std::future::Future;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, UpstreamError};
use crate::job::JobKind;
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::retry::{RetryConfig, RetryConfigUpdate, RetryPolicy};

/// Default deadline for a single upstream attempt.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Aggregate call statistics since startup or the last reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rate_limited_calls: u64,
    pub retried_calls: u64,
    /// `avg = (avg + latest) / 2` over successful calls, starting from 0.
    pub average_response_time_ms: f64,
}

impl CallStats {
    fn record_response_time(&mut self, elapsed: Duration) {
        let latest = elapsed.as_micros() as f64 / 1000.0;
        self.average_response_time_ms = (self.average_response_time_ms + latest) / 2.0;
    }
}

/// Outcome of `ApiGateway::call`.
#[derive(Debug)]
pub struct CallResult<T> {
    pub outcome: Result<T, GatewayError>,
    /// Attempts beyond the first.
    pub retry_count: u32,
    /// Wall time of the whole call, admission waits included.
    pub response_time: Duration,
}

impl<T> CallResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.outcome.as_ref().err().and_then(GatewayError::status_code)
    }

    pub fn into_result(self) -> Result<T, GatewayError> {
        self.outcome
    }
}

/// Admission, timeout, retry and accounting around one upstream invocation.
pub struct ApiGateway {
    limiter: RateLimiter,
    retry: RwLock<RetryPolicy>,
    stats: Mutex<CallStats>,
    call_timeout: Duration,
}

impl ApiGateway {
    pub fn new(limiter: RateLimiter, retry: RetryConfig, call_timeout: Duration) -> Self {
        Self {
            limiter,
            retry: RwLock::new(RetryPolicy::new(retry)),
            stats: Mutex::new(CallStats::default()),
            call_timeout,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry.read().config().clone()
    }

    /// Apply a partial retry update. Calls already in progress keep their policy.
    pub fn update_retry_config(&self, update: &RetryConfigUpdate) {
        let mut retry = self.retry.write();
        retry.update(update);
        info!("Retry config updated: {:?}", retry.config());
    }

    pub fn stats(&self) -> CallStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = CallStats::default();
    }

    /// Run `invoke` against `endpoint` under rate limiting and retry.
    ///
    /// Waiting for admission does not use up an attempt. Each attempt is cut
    /// off after the call timeout and counts as a retryable failure.
    pub async fn call<T, F, Fut>(&self, endpoint: &str, kind: JobKind, mut invoke: F) -> CallResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let started = Instant::now();
        let policy = self.retry.read().clone();
        self.stats.lock().total_calls += 1;

        let mut attempt: u32 = 0;
        let mut last_error: Option<UpstreamError> = None;
        loop {
            let adaptive_delay = match self.admit(endpoint).await {
                Ok(delay) => delay,
                Err(e) => {
                    self.stats.lock().failed_calls += 1;
                    // A denial after a failed attempt still reports that failure.
                    let outcome = match last_error {
                        Some(last) => GatewayError::MaxRetriesExceeded {
                            attempts: attempt,
                            last,
                        },
                        None => e,
                    };
                    return CallResult {
                        outcome: Err(outcome),
                        retry_count: attempt,
                        response_time: started.elapsed(),
                    };
                }
            };
            if !adaptive_delay.is_zero() {
                debug!("Adaptive delay of {:?} before {}", adaptive_delay, endpoint);
                tokio::time::sleep(adaptive_delay).await;
            }

            attempt += 1;
            let result = match tokio::time::timeout(self.call_timeout, invoke()).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Timeout(self.call_timeout)),
            };

            let error = match result {
                Ok(data) => {
                    self.limiter.handle_success_response(endpoint);
                    let response_time = started.elapsed();
                    {
                        let mut stats = self.stats.lock();
                        stats.successful_calls += 1;
                        stats.record_response_time(response_time);
                    }
                    return CallResult {
                        outcome: Ok(data),
                        retry_count: attempt - 1,
                        response_time,
                    };
                }
                Err(e) => e,
            };

            if error.is_rate_limited() {
                self.stats.lock().rate_limited_calls += 1;
                self.limiter.handle_429_response(endpoint, error.retry_after());
            }

            if policy.should_retry(attempt, &error) {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} call to {} failed (attempt {}/{}): {}; retrying in {:?}",
                    kind,
                    endpoint,
                    attempt,
                    policy.max_attempts(),
                    error,
                    delay
                );
                self.stats.lock().retried_calls += 1;
                last_error = Some(error);
                tokio::time::sleep(delay).await;
                continue;
            }

            self.stats.lock().failed_calls += 1;
            let outcome = if error.is_retryable() {
                warn!(
                    "{} call to {} gave up after {} attempts: {}",
                    kind, endpoint, attempt, error
                );
                GatewayError::MaxRetriesExceeded {
                    attempts: attempt,
                    last: error,
                }
            } else {
                warn!("{} call to {} failed: {}", kind, endpoint, error);
                GatewayError::Upstream(error)
            };
            return CallResult {
                outcome: Err(outcome),
                retry_count: attempt - 1,
                response_time: started.elapsed(),
            };
        }
    }

    /// Wait out limiter delays until the request is admitted and recorded.
    ///
    /// Returns the adaptive delay to apply before dispatch.
    async fn admit(&self, endpoint: &str) -> Result<Duration, GatewayError> {
        loop {
            match self.limiter.acquire(endpoint) {
                RateDecision::Allowed { adaptive_delay } => return Ok(adaptive_delay),
                RateDecision::Denied { delay, reason } if !delay.is_zero() => {
                    debug!(
                        "Waiting {:?} for admission to {} ({})",
                        delay, endpoint, reason
                    );
                    tokio::time::sleep(delay).await;
                }
                RateDecision::Denied { reason, .. } => {
                    warn!("Admission to {} denied ({}) with no delay", endpoint, reason);
                    return Err(GatewayError::RateLimited {
                        endpoint: endpoint.to_string(),
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for ApiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiGateway")
            .field("limiter", &self.limiter)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::clock::TokioClock;
    use crate::rate_limit::EndpointLimits;

    const ENDPOINT: &str = "cricket_odds";

    fn create_gateway(limits: EndpointLimits) -> ApiGateway {
        let limiter = RateLimiter::new(limits, TokioClock::shared());
        ApiGateway::new(
            limiter,
            RetryConfig {
                max_retries: 2,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                backoff_multiplier: 2.0,
                jitter: false,
                jitter_max: Duration::ZERO,
            },
            Duration::from_secs(2),
        )
    }

    fn loose_limits() -> EndpointLimits {
        EndpointLimits {
            min_interval: Duration::ZERO,
            backoff: Duration::from_secs(1),
            adaptive_step: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let gateway = create_gateway(loose_limits());

        let result = gateway
            .call(ENDPOINT, JobKind::CricketOdds, || async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok::<_, UpstreamError>("odds")
            })
            .await;

        assert!(result.is_success());
        assert_eq!(result.retry_count, 0);
        let stats = gateway.stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.successful_calls, 1);
        assert_eq!(stats.average_response_time_ms, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_then_success_sets_and_decays_adaptive_delay() {
        let gateway = create_gateway(loose_limits());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = gateway
            .call(ENDPOINT, JobKind::CricketOdds, move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(UpstreamError::http(429, "Too Many Requests"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.retry_count, 1);
        assert_eq!(result.into_result().unwrap(), 42);
        // Backoff of 1s was waited out before the second attempt.
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let status = gateway.limiter().status(ENDPOINT).unwrap();
        assert_eq!(status.adaptive_delay_ms, 100);
        assert_eq!(status.rate_limit_hits, 1);

        let stats = gateway.stats();
        assert_eq!(stats.rate_limited_calls, 1);
        assert_eq!(stats.retried_calls, 1);
        assert_eq!(stats.successful_calls, 1);

        gateway
            .call(ENDPOINT, JobKind::CricketOdds, || async { Ok::<_, UpstreamError>(()) })
            .await;
        assert_eq!(gateway.limiter().status(ENDPOINT).unwrap().adaptive_delay_ms, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_wait_does_not_consume_attempts() {
        let gateway = create_gateway(loose_limits());
        gateway.limiter().handle_429_response(ENDPOINT, Some(Duration::from_secs(5)));
        let started = Instant::now();

        let result = gateway
            .call(ENDPOINT, JobKind::CricketOdds, || async { Ok::<_, UpstreamError>(()) })
            .await;

        assert!(result.is_success());
        assert_eq!(result.retry_count, 0);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_is_terminal() {
        let gateway = create_gateway(loose_limits());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = gateway
            .call(ENDPOINT, JobKind::CricketScorecard, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(UpstreamError::http(400, "unknown event")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.status_code(), Some(400));
        assert!(matches!(result.outcome, Err(GatewayError::Upstream(_))));
        assert_eq!(gateway.stats().failed_calls, 1);
        assert_eq!(gateway.stats().retried_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_last_error() {
        let gateway = create_gateway(loose_limits());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = gateway
            .call(ENDPOINT, JobKind::CasinoData, move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(UpstreamError::http(500 + n as u16, "upstream down")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.retry_count, 2);
        match result.outcome {
            Err(GatewayError::MaxRetriesExceeded { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.status_code(), Some(502));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(gateway.stats().retried_calls, 2);
        assert_eq!(gateway.stats().failed_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_upstream_times_out() {
        let gateway = create_gateway(loose_limits());
        gateway.update_retry_config(&RetryConfigUpdate {
            max_retries: Some(0),
            ..Default::default()
        });

        let result = gateway
            .call(ENDPOINT, JobKind::CasinoTv, || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, UpstreamError>(())
            })
            .await;

        match result.outcome {
            Err(GatewayError::MaxRetriesExceeded { attempts: 1, last }) => {
                assert!(matches!(last, UpstreamError::Timeout(_)));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(result.response_time, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_window_fails_immediately() {
        let gateway = create_gateway(EndpointLimits {
            max_requests: 0,
            ..loose_limits()
        });

        let result = gateway
            .call(ENDPOINT, JobKind::CricketOdds, || async { Ok::<_, UpstreamError>(()) })
            .await;

        assert!(matches!(
            result.outcome,
            Err(GatewayError::RateLimited { ref endpoint }) if endpoint == ENDPOINT
        ));
        assert_eq!(gateway.stats().failed_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_dispatches_keep_min_interval_while_adaptive_decays() {
        let gateway = create_gateway(EndpointLimits {
            min_interval: Duration::from_secs(2),
            backoff: Duration::from_secs(1),
            adaptive_step: Duration::from_millis(1600),
            ..Default::default()
        });
        gateway.limiter().handle_429_response(ENDPOINT, None);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let dispatched = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let call = || {
            let dispatched = Arc::clone(&dispatched);
            gateway.call(ENDPOINT, JobKind::CricketOdds, move || {
                dispatched.lock().push(Instant::now());
                async { Ok::<_, UpstreamError>(()) }
            })
        };
        let (first, second) = tokio::join!(call(), call());
        assert!(first.is_success() && second.is_success());

        let mut times = dispatched.lock().clone();
        times.sort();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_after_failed_attempt_keeps_last_error() {
        let gateway = create_gateway(loose_limits());

        let result = gateway
            .call(ENDPOINT, JobKind::CasinoResults, || {
                // Capacity drops to zero; the first admission ages out during the retry delay.
                gateway.limiter().set_endpoint_config(
                    ENDPOINT,
                    EndpointLimits {
                        max_requests: 0,
                        window: Duration::from_millis(50),
                        ..loose_limits()
                    },
                );
                async { Err::<(), _>(UpstreamError::http(503, "maintenance")) }
            })
            .await;

        assert_eq!(result.retry_count, 1);
        assert_eq!(result.status_code(), Some(503));
        match result.outcome {
            Err(GatewayError::MaxRetriesExceeded { attempts, last }) => {
                assert_eq!(attempts, 1);
                assert_eq!(last.status_code(), Some(503));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        let stats = gateway.stats();
        assert_eq!(stats.retried_calls, 1);
        assert_eq!(stats.failed_calls, 1);
    }
}
