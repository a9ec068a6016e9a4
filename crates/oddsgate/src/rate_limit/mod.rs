//! Per-endpoint admission control for upstream requests.
//!
//! Each logical endpoint (e.g. `cricket_odds`) gets its own sliding request
//! window, minimum spacing between requests, a hard backoff window after a
//! 429, and an adaptive delay that grows under throttling and decays under
//! sustained success.

mod config;
mod limiter;
mod state;

pub use config::{EndpointLimits, ADAPTIVE_DELAY_FLOOR};
pub use limiter::RateLimiter;
pub use state::{EndpointRateState, EndpointStatus, RateDecision, RejectReason};

use std::time::Duration;

/// Longest `Retry-After` we are willing to honour.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Parse Retry-After header value (seconds).
/// Returns duration to wait, or None if header is missing/invalid.
pub fn parse_retry_after(header_value: Option<&str>) -> Option<Duration> {
    let value = header_value?;
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}
