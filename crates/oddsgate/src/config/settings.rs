//! Resolved runtime settings.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::gateway::DEFAULT_CALL_TIMEOUT;
use crate::job::JobKind;
use crate::queue::QueueConfig;
use crate::rate_limit::EndpointLimits;
use crate::retry::RetryConfig;
use crate::upstream::UpstreamConfig;

/// Everything needed to start a `FeedService`.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub upstream: UpstreamConfig,
    pub queue: QueueConfig,
    /// Retry policy for gateway calls.
    pub retry: RetryConfig,
    /// Hard deadline per upstream attempt.
    pub request_timeout: Duration,
    /// Limits for endpoints without their own entry.
    pub default_endpoint: EndpointLimits,
    /// Per-endpoint limits, keyed by endpoint name.
    pub endpoints: BTreeMap<String, EndpointLimits>,
    /// Config file these settings were loaded from, if any.
    pub source_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let endpoints = JobKind::all()
            .iter()
            .filter_map(|kind| {
                EndpointLimits::preset(kind.as_str()).map(|limits| (kind.as_str().to_string(), limits))
            })
            .collect();

        Self {
            upstream: UpstreamConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            request_timeout: DEFAULT_CALL_TIMEOUT,
            default_endpoint: EndpointLimits::default(),
            endpoints,
            source_path: None,
        }
    }
}

impl Settings {
    /// Limits in effect for an endpoint.
    pub fn endpoint_limits(&self, endpoint: &str) -> EndpointLimits {
        self.endpoints
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| self.default_endpoint.clone())
    }

    /// Apply `ODDSGATE_*` environment variables.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        // ODDSGATE_UPSTREAM_URL - base URL of the feed provider
        if let Some(url) = lookup("ODDSGATE_UPSTREAM_URL").filter(|url| !url.is_empty()) {
            self.upstream.base_url = url;
        }

        if let Some(n) = parse_var::<usize>(&lookup, "ODDSGATE_MAX_CONCURRENT") {
            self.queue.max_concurrent = n.max(1);
        }

        if let Some(n) = parse_var::<usize>(&lookup, "ODDSGATE_MAX_QUEUE_SIZE") {
            self.queue.max_queue_size = n;
        }

        // Applies to direct calls and to queued jobs alike
        if let Some(n) = parse_var::<u32>(&lookup, "ODDSGATE_MAX_RETRIES") {
            self.retry.max_retries = n;
            self.queue.default_max_attempts = n.saturating_add(1);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "ODDSGATE_REQUEST_TIMEOUT_MS") {
            self.request_timeout = Duration::from_millis(ms);
            self.upstream.timeout = Duration::from_millis(ms);
        }

        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}: '{}' is not a valid number", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_carry_presets() {
        let settings = Settings::default();
        assert_eq!(settings.endpoints.len(), JobKind::all().len());
        assert_eq!(settings.endpoint_limits("cricket_odds"), EndpointLimits::cricket_odds());
        assert_eq!(settings.endpoint_limits("somewhere_else"), EndpointLimits::default());
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings::default().with_overrides_from(lookup(&[
            ("ODDSGATE_UPSTREAM_URL", "https://feeds.example.com"),
            ("ODDSGATE_MAX_CONCURRENT", "12"),
            ("ODDSGATE_MAX_RETRIES", "5"),
            ("ODDSGATE_REQUEST_TIMEOUT_MS", "2500"),
        ]));

        assert_eq!(settings.upstream.base_url, "https://feeds.example.com");
        assert_eq!(settings.queue.max_concurrent, 12);
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.queue.default_max_attempts, 6);
        assert_eq!(settings.request_timeout, Duration::from_millis(2500));
        assert_eq!(settings.queue.max_queue_size, QueueConfig::default().max_queue_size);
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let settings = Settings::default().with_overrides_from(lookup(&[
            ("ODDSGATE_MAX_QUEUE_SIZE", "lots"),
            ("ODDSGATE_MAX_CONCURRENT", "0"),
        ]));
        assert_eq!(settings.queue.max_queue_size, 1000);
        assert_eq!(settings.queue.max_concurrent, 1);
    }
}
