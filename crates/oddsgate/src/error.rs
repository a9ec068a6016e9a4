//! Error types for upstream calls, the gateway, the job queue and config loading.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::job::JobKind;

/// Failure reported by an upstream fetch.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Upstream answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        /// Parsed `Retry-After` hint, if the upstream sent one.
        retry_after: Option<Duration>,
    },
    /// Connection, DNS or TLS failure before a status was received.
    #[error("Network error: {0}")]
    Network(String),
    /// The call exceeded its deadline and was abandoned.
    #[error("Upstream call timed out after {0:?}")]
    Timeout(Duration),
    /// Body could not be decoded.
    #[error("Invalid upstream response: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// HTTP status, when the failure carried one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// 429, or an error whose message says it was throttled.
    pub fn is_rate_limited(&self) -> bool {
        if self.status_code() == Some(429) {
            return true;
        }
        let message = self.to_string().to_lowercase();
        message.contains("rate limit") || message.contains("too many requests")
    }

    /// 4xx that is not throttling: the request itself is wrong, retrying won't help.
    pub fn is_validation(&self) -> bool {
        matches!(self.status_code(), Some(status) if (400..500).contains(&status))
            && !self.is_rate_limited()
    }

    /// Network errors, timeouts, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status >= 500 || self.is_rate_limited(),
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Decode(_) => false,
        }
    }
}

/// Failure returned from `ApiGateway::call`.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Admission was denied and the limiter offered no delay to wait out.
    #[error("Rate limited on {endpoint}: admission denied")]
    RateLimited { endpoint: String },
    /// Terminal upstream failure (not retryable).
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// Every attempt failed; carries the last underlying error.
    #[error("Gave up after {attempts} attempts: {last}")]
    MaxRetriesExceeded { attempts: u32, last: UpstreamError },
}

impl GatewayError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => None,
            Self::Upstream(e) | Self::MaxRetriesExceeded { last: e, .. } => e.status_code(),
        }
    }

    /// Whether a later, independent attempt (e.g. a queue retry) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::MaxRetriesExceeded { .. } => true,
            Self::Upstream(e) => e.is_retryable(),
        }
    }
}

/// Errors from job queue admission.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("Queue full ({capacity} pending jobs)")]
    QueueFull { capacity: usize },
    #[error("No processor registered for job kind '{0}'")]
    NoProcessor(JobKind),
}

/// Errors from loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {format} config: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },
    #[error("Invalid upstream URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(UpstreamError::http(429, "slow down").is_rate_limited());
        assert!(UpstreamError::http(429, "slow down").is_retryable());
        assert!(UpstreamError::http(503, "unavailable").is_retryable());
        assert!(!UpstreamError::http(503, "unavailable").is_rate_limited());
        assert!(UpstreamError::network("connection reset").is_retryable());
        assert!(UpstreamError::Timeout(Duration::from_secs(5)).is_retryable());

        let bad_request = UpstreamError::http(400, "unknown event id");
        assert!(bad_request.is_validation());
        assert!(!bad_request.is_retryable());
        assert!(!UpstreamError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn test_rate_limit_detected_from_message() {
        let err = UpstreamError::http(403, "Rate limit exceeded for key");
        assert!(err.is_rate_limited());
        assert!(err.is_retryable());
        assert!(!err.is_validation());
        assert!(UpstreamError::http(403, "forbidden").is_validation());
        assert!(UpstreamError::network("Too Many Requests").is_rate_limited());
    }

    #[test]
    fn test_gateway_error_status() {
        let err = GatewayError::MaxRetriesExceeded {
            attempts: 4,
            last: UpstreamError::http(502, "bad gateway"),
        };
        assert_eq!(err.status_code(), Some(502));
        assert!(err.is_retryable());

        let err = GatewayError::from(UpstreamError::http(404, "no such market"));
        assert_eq!(err.status_code(), Some(404));
        assert!(!err.is_retryable());
    }
}
