//! Adaptive per-endpoint rate limiter.
//!
//! Shared across every caller of an upstream. All state lives behind one
//! mutex, so `acquire` (check + record) is atomic even on a multi-threaded
//! runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::config::EndpointLimits;
use super::state::{EndpointRateState, EndpointStatus, RateDecision};
use crate::clock::SharedClock;

#[derive(Debug, Default)]
struct LimiterState {
    default_limits: EndpointLimits,
    limits: HashMap<String, EndpointLimits>,
    endpoints: HashMap<String, EndpointRateState>,
}

impl LimiterState {
    fn limits_for(&self, endpoint: &str) -> EndpointLimits {
        self.limits
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| self.default_limits.clone())
    }

    fn entry(&mut self, endpoint: &str) -> &mut EndpointRateState {
        self.endpoints.entry(endpoint.to_string()).or_default()
    }
}

/// Per-endpoint admission gate.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<LimiterState>>,
    clock: SharedClock,
}

impl RateLimiter {
    /// Create a limiter applying `default_limits` to endpoints without their own config.
    pub fn new(default_limits: EndpointLimits, clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                default_limits,
                ..Default::default()
            })),
            clock,
        }
    }

    /// Set the policy for one endpoint. Existing counters are kept.
    pub fn set_endpoint_config(&self, endpoint: &str, limits: EndpointLimits) {
        debug!("Rate limits for {} set to {:?}", endpoint, limits);
        self.state.lock().limits.insert(endpoint.to_string(), limits);
    }

    /// Policy in effect for an endpoint.
    pub fn endpoint_config(&self, endpoint: &str) -> EndpointLimits {
        self.state.lock().limits_for(endpoint)
    }

    /// Check whether a request may go out now, without counting it.
    pub fn check(&self, endpoint: &str) -> RateDecision {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let limits = state.limits_for(endpoint);
        state.entry(endpoint).check(&limits, now)
    }

    /// Count a request that is actually being dispatched.
    pub fn record_request(&self, endpoint: &str) {
        let now = self.clock.now();
        self.state.lock().entry(endpoint).record(now);
    }

    /// Check and, when allowed, record in one step.
    ///
    /// The request is recorded at its dispatch instant, `now` plus the
    /// adaptive delay the caller must still sleep.
    pub fn acquire(&self, endpoint: &str) -> RateDecision {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let limits = state.limits_for(endpoint);
        let entry = state.entry(endpoint);
        let decision = entry.check(&limits, now);
        if let RateDecision::Allowed { adaptive_delay } = decision {
            entry.record(now + adaptive_delay);
        } else {
            debug!(
                "Admission to {} denied ({}), retry in {:?}",
                endpoint,
                decision.reason().map(|r| r.as_str()).unwrap_or("unknown"),
                decision.delay()
            );
        }
        decision
    }

    /// Report a 429 (or equivalent throttling) from the upstream.
    pub fn handle_429_response(&self, endpoint: &str, retry_after: Option<Duration>) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let limits = state.limits_for(endpoint);
        let entry = state.entry(endpoint);
        entry.on_rate_limited(&limits, now, retry_after);

        warn!(
            "Rate limited by {}, backing off for {:?} (adaptive delay {:?})",
            endpoint,
            entry
                .backoff_until()
                .map(|until| until.saturating_duration_since(now))
                .unwrap_or_default(),
            entry.adaptive_delay()
        );
    }

    /// Report a successful response; decays the adaptive delay.
    pub fn handle_success_response(&self, endpoint: &str) {
        let mut state = self.state.lock();
        let limits = state.limits_for(endpoint);
        let entry = state.entry(endpoint);
        if entry.on_success(&limits) {
            info!("Endpoint {} recovered from adaptive backoff", endpoint);
        } else if !entry.adaptive_delay().is_zero() {
            debug!(
                "Endpoint {} adaptive delay reduced to {:?}",
                endpoint,
                entry.adaptive_delay()
            );
        }
    }

    /// Status of one endpoint, if it has been used.
    pub fn status(&self, endpoint: &str) -> Option<EndpointStatus> {
        let now = self.clock.now();
        let state = self.state.lock();
        let limits = state.limits_for(endpoint);
        state
            .endpoints
            .get(endpoint)
            .map(|entry| entry.status(endpoint, &limits, now))
    }

    /// Status of every endpoint that has been used, ordered by key.
    pub fn status_all(&self) -> BTreeMap<String, EndpointStatus> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .endpoints
            .iter()
            .map(|(endpoint, entry)| {
                let limits = state.limits_for(endpoint);
                (endpoint.clone(), entry.status(endpoint, &limits, now))
            })
            .collect()
    }

    /// Forget all state for one endpoint. Its config is kept.
    pub fn reset(&self, endpoint: &str) {
        self.state.lock().endpoints.remove(endpoint);
    }

    /// Forget state for every endpoint.
    pub fn reset_all(&self) {
        self.state.lock().endpoints.clear();
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RateLimiter")
            .field("default_limits", &state.default_limits)
            .field("endpoints", &state.endpoints.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::super::RejectReason;
    use super::*;
    use crate::clock::ManualClock;

    fn create_test_limiter(limits: EndpointLimits) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(limits, clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_burst_fills_window_then_rejects() {
        let (limiter, _clock) = create_test_limiter(EndpointLimits {
            window: Duration::from_secs(60),
            max_requests: 30,
            min_interval: Duration::ZERO,
            ..Default::default()
        });

        let allowed = (0..30)
            .filter(|_| limiter.acquire("cricket_odds").is_allowed())
            .count();
        assert_eq!(allowed, 30);

        let decision = limiter.acquire("cricket_odds");
        assert_eq!(decision.reason(), Some(RejectReason::WindowExceeded));
        assert_eq!(decision.delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_instant_burst_hits_min_interval_first() {
        let (limiter, clock) = create_test_limiter(EndpointLimits::cricket_odds());

        assert!(limiter.acquire("cricket_odds").is_allowed());
        clock.advance(Duration::from_millis(500));

        let decision = limiter.acquire("cricket_odds");
        assert_eq!(decision.reason(), Some(RejectReason::MinInterval));
        assert_eq!(decision.delay(), Duration::from_millis(1500));

        clock.advance(Duration::from_millis(1500));
        assert!(limiter.acquire("cricket_odds").is_allowed());
    }

    #[test]
    fn test_backoff_takes_precedence_for_full_duration() {
        let (limiter, clock) = create_test_limiter(EndpointLimits {
            backoff: Duration::from_secs(10),
            min_interval: Duration::ZERO,
            ..Default::default()
        });

        assert!(limiter.acquire("casino_data").is_allowed());
        limiter.handle_429_response("casino_data", None);

        let decision = limiter.check("casino_data");
        assert_eq!(decision.reason(), Some(RejectReason::Backoff));
        assert_eq!(decision.delay(), Duration::from_secs(10));

        clock.advance(Duration::from_millis(9_999));
        assert_eq!(
            limiter.check("casino_data").reason(),
            Some(RejectReason::Backoff)
        );

        clock.advance(Duration::from_millis(1));
        assert!(limiter.check("casino_data").is_allowed());
        let status = limiter.status("casino_data").unwrap();
        assert!(!status.in_backoff);
        assert_eq!(status.rate_limit_hits, 1);
    }

    #[test]
    fn test_recorded_requests_only_count_when_dispatched() {
        let (limiter, _clock) = create_test_limiter(EndpointLimits {
            max_requests: 2,
            min_interval: Duration::ZERO,
            ..Default::default()
        });

        for _ in 0..5 {
            assert!(limiter.check("casino_tv").is_allowed());
        }
        limiter.record_request("casino_tv");
        limiter.record_request("casino_tv");
        assert_eq!(
            limiter.check("casino_tv").reason(),
            Some(RejectReason::WindowExceeded)
        );
        assert_eq!(limiter.status("casino_tv").unwrap().total_requests, 2);
    }

    #[test]
    fn test_adaptive_delay_returned_with_admission() {
        let (limiter, clock) = create_test_limiter(EndpointLimits {
            backoff: Duration::from_secs(1),
            adaptive_step: Duration::from_millis(400),
            min_interval: Duration::ZERO,
            ..Default::default()
        });

        limiter.handle_429_response("cricket_odds", None);
        clock.advance(Duration::from_secs(1));

        assert_eq!(
            limiter.acquire("cricket_odds"),
            RateDecision::Allowed {
                adaptive_delay: Duration::from_millis(400)
            }
        );

        limiter.handle_success_response("cricket_odds");
        assert_eq!(
            limiter.status("cricket_odds").unwrap().adaptive_delay_ms,
            200
        );
    }

    #[test]
    fn test_admission_recorded_at_dispatch_instant() {
        let (limiter, clock) = create_test_limiter(EndpointLimits {
            backoff: Duration::from_secs(1),
            adaptive_step: Duration::from_millis(1600),
            min_interval: Duration::from_secs(2),
            ..Default::default()
        });

        limiter.handle_429_response("cricket_odds", None);
        clock.advance(Duration::from_secs(1));
        assert_eq!(
            limiter.acquire("cricket_odds"),
            RateDecision::Allowed {
                adaptive_delay: Duration::from_millis(1600)
            }
        );

        // Dispatch happens 1.6s from now, so the next slot opens 3.6s from now.
        let decision = limiter.acquire("cricket_odds");
        assert_eq!(decision.reason(), Some(RejectReason::MinInterval));
        assert_eq!(decision.delay(), Duration::from_millis(3600));

        clock.advance(Duration::from_millis(3599));
        assert!(!limiter.check("cricket_odds").is_allowed());
        clock.advance(Duration::from_millis(1));
        assert!(limiter.check("cricket_odds").is_allowed());
    }

    #[test]
    fn test_endpoint_configs_are_independent() {
        let (limiter, _clock) = create_test_limiter(EndpointLimits::default());
        limiter.set_endpoint_config(
            "cricket_odds",
            EndpointLimits {
                max_requests: 1,
                ..EndpointLimits::cricket_odds()
            },
        );
        limiter.set_endpoint_config("casino_data", EndpointLimits::casino());

        assert!(limiter.acquire("cricket_odds").is_allowed());
        assert!(!limiter.acquire("cricket_odds").is_allowed());
        assert!(limiter.acquire("casino_data").is_allowed());
        assert_eq!(limiter.endpoint_config("casino_data").max_requests, 120);
        assert_eq!(limiter.endpoint_config("unknown").max_requests, 60);
    }

    #[test]
    fn test_reset_and_reset_all() {
        let (limiter, _clock) = create_test_limiter(EndpointLimits::default());
        limiter.acquire("a");
        limiter.acquire("b");
        limiter.handle_429_response("a", None);

        limiter.reset("a");
        assert!(limiter.status("a").is_none());
        assert!(limiter.check("a").is_allowed());
        assert_eq!(limiter.status_all().len(), 2);

        limiter.reset_all();
        assert!(limiter.status_all().is_empty());
    }
}
