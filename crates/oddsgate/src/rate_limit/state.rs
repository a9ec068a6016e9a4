//! Rate state for a single endpoint.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::config::{EndpointLimits, ADAPTIVE_DELAY_FLOOR};

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Endpoint is inside a post-429 backoff window.
    Backoff,
    /// The sliding window already holds `max_requests` admissions.
    WindowExceeded,
    /// Previous request was too recent.
    MinInterval,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backoff => "backoff",
            Self::WindowExceeded => "window_exceeded",
            Self::MinInterval => "min_interval",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Go ahead, after sleeping `adaptive_delay` (zero unless adaptive is on).
    Allowed { adaptive_delay: Duration },
    /// Not now. `delay` is how long until the blocking condition clears.
    Denied {
        delay: Duration,
        reason: RejectReason,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Wait needed before the next check can succeed (zero when allowed).
    pub fn delay(&self) -> Duration {
        match self {
            Self::Allowed { .. } => Duration::ZERO,
            Self::Denied { delay, .. } => *delay,
        }
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Self::Allowed { .. } => None,
            Self::Denied { reason, .. } => Some(*reason),
        }
    }
}

/// Snapshot of an endpoint's limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub window_count: usize,
    pub max_requests: u32,
    pub window_ms: u64,
    /// Time until the oldest admission leaves the window.
    pub window_resets_in_ms: u64,
    pub in_backoff: bool,
    pub backoff_remaining_ms: u64,
    pub adaptive_delay_ms: u64,
    pub total_requests: u64,
    pub rate_limit_hits: u64,
}

/// Mutable limiter state for one endpoint key.
///
/// The window is a log of admission instants, so no `window` long interval
/// ever holds more than `max_requests` admissions. The oldest live entry is
/// the window start and the log length is the window count.
#[derive(Debug, Clone, Default)]
pub struct EndpointRateState {
    admitted: VecDeque<Instant>,
    last_request_at: Option<Instant>,
    backoff_until: Option<Instant>,
    adaptive_delay: Duration,
    total_requests: u64,
    rate_limit_hits: u64,
}

impl EndpointRateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop admissions that have aged out of the window.
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Decide whether a request may be dispatched at `now`. Does not record it.
    pub fn check(&mut self, limits: &EndpointLimits, now: Instant) -> RateDecision {
        if let Some(until) = self.backoff_until {
            if now < until {
                return RateDecision::Denied {
                    delay: until - now,
                    reason: RejectReason::Backoff,
                };
            }
            self.backoff_until = None;
        }

        self.prune(limits.window, now);

        if self.admitted.len() >= limits.max_requests as usize {
            let delay = self
                .admitted
                .front()
                .map(|&oldest| (oldest + limits.window).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);
            return RateDecision::Denied {
                delay,
                reason: RejectReason::WindowExceeded,
            };
        }

        // `last_request_at` may lie ahead of `now` while an adaptive delay runs.
        if let Some(last) = self.last_request_at.filter(|_| !limits.min_interval.is_zero()) {
            let next_allowed = last + limits.min_interval;
            if now < next_allowed {
                return RateDecision::Denied {
                    delay: next_allowed - now,
                    reason: RejectReason::MinInterval,
                };
            }
        }

        RateDecision::Allowed {
            adaptive_delay: if limits.adaptive {
                self.adaptive_delay
            } else {
                Duration::ZERO
            },
        }
    }

    /// Count a dispatched request.
    pub fn record(&mut self, now: Instant) {
        self.admitted.push_back(now);
        self.last_request_at = Some(now);
        self.total_requests += 1;
    }

    /// Enter backoff after a 429. A longer `retry_after` wins over the configured backoff.
    pub fn on_rate_limited(
        &mut self,
        limits: &EndpointLimits,
        now: Instant,
        retry_after: Option<Duration>,
    ) {
        self.rate_limit_hits += 1;

        let backoff = retry_after.map_or(limits.backoff, |hint| hint.max(limits.backoff));
        let until = now + backoff;
        self.backoff_until = Some(match self.backoff_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });

        if limits.adaptive {
            self.adaptive_delay = (self.adaptive_delay * 2)
                .max(limits.adaptive_step)
                .min(limits.max_adaptive_delay);
        }
    }

    /// Decay the adaptive delay. Returns true when it just reached zero.
    pub fn on_success(&mut self, limits: &EndpointLimits) -> bool {
        if !limits.adaptive || self.adaptive_delay.is_zero() {
            return false;
        }
        self.adaptive_delay /= 2;
        if self.adaptive_delay < ADAPTIVE_DELAY_FLOOR {
            self.adaptive_delay = Duration::ZERO;
            return true;
        }
        false
    }

    /// Start of the current window (oldest live admission).
    pub fn window_start(&self) -> Option<Instant> {
        self.admitted.front().copied()
    }

    pub fn window_count(&self) -> usize {
        self.admitted.len()
    }

    pub fn last_request_at(&self) -> Option<Instant> {
        self.last_request_at
    }

    pub fn backoff_until(&self) -> Option<Instant> {
        self.backoff_until
    }

    pub fn adaptive_delay(&self) -> Duration {
        self.adaptive_delay
    }

    pub fn status(&self, endpoint: &str, limits: &EndpointLimits, now: Instant) -> EndpointStatus {
        let live: Vec<Instant> = self
            .admitted
            .iter()
            .copied()
            .filter(|&t| now.saturating_duration_since(t) < limits.window)
            .collect();
        let window_resets_in = live
            .first()
            .map(|&oldest| (oldest + limits.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        let backoff_remaining = self
            .backoff_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        EndpointStatus {
            endpoint: endpoint.to_string(),
            window_count: live.len(),
            max_requests: limits.max_requests,
            window_ms: limits.window.as_millis() as u64,
            window_resets_in_ms: window_resets_in.as_millis() as u64,
            in_backoff: !backoff_remaining.is_zero(),
            backoff_remaining_ms: backoff_remaining.as_millis() as u64,
            adaptive_delay_ms: self.adaptive_delay.as_millis() as u64,
            total_requests: self.total_requests,
            rate_limit_hits: self.rate_limit_hits,
        }
    }
}
