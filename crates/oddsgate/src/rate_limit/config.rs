//! Rate limiter configuration.

use std::time::Duration;

/// Adaptive delays below this snap to zero while decaying.
pub const ADAPTIVE_DELAY_FLOOR: Duration = Duration::from_millis(10);

/// Admission policy for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointLimits {
    /// Length of the sliding request window.
    pub window: Duration,
    /// Requests admitted per window.
    pub max_requests: u32,
    /// Minimum spacing between two admitted requests.
    pub min_interval: Duration,
    /// How long all requests are refused after a 429.
    pub backoff: Duration,
    /// Whether the adaptive delay is applied.
    pub adaptive: bool,
    /// Adaptive delay applied on the first 429 (doubling starts from here).
    pub adaptive_step: Duration,
    /// Ceiling for the adaptive delay.
    pub max_adaptive_delay: Duration,
}

impl Default for EndpointLimits {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 60,
            min_interval: Duration::from_millis(500),
            backoff: Duration::from_secs(30),
            adaptive: true,
            adaptive_step: Duration::from_millis(500),
            max_adaptive_delay: Duration::from_secs(10),
        }
    }
}

impl EndpointLimits {
    /// Live cricket odds: tight window, low latency tolerance.
    pub fn cricket_odds() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 30,
            min_interval: Duration::from_secs(2),
            backoff: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Scorecards change slower than odds.
    pub fn cricket_scorecard() -> Self {
        Self {
            max_requests: 20,
            min_interval: Duration::from_secs(3),
            ..Self::cricket_odds()
        }
    }

    /// Casino fixtures tolerate looser pacing.
    pub fn casino() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 120,
            min_interval: Duration::from_millis(250),
            backoff: Duration::from_secs(15),
            adaptive: false,
            ..Self::default()
        }
    }

    /// Built-in policy for a well-known endpoint key.
    pub fn preset(endpoint: &str) -> Option<Self> {
        match endpoint {
            "cricket_odds" => Some(Self::cricket_odds()),
            "cricket_scorecard" => Some(Self::cricket_scorecard()),
            "casino_data" | "casino_results" | "casino_tv" => Some(Self::casino()),
            _ => None,
        }
    }
}
