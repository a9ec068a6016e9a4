//! Upstream feed client and result sink contract.
//!
//! `UpstreamClient` is a thin reqwest wrapper with one fetch per resource.
//! Everything else in the crate talks to it through the `Upstream` trait so
//! tests and alternative transports can be plugged in.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::error::{ConfigError, UpstreamError};
use crate::job::{JobKind, JobPayload};
use crate::rate_limit::parse_retry_after;

/// Default User-Agent for upstream requests.
pub const USER_AGENT: &str = concat!("oddsgate/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept in an `UpstreamError` message.
const MAX_ERROR_BODY: usize = 200;

/// Path templates per resource, relative to the base URL.
///
/// `{id}` must be a whole path segment; it is replaced by the payload's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamPaths {
    pub cricket_odds: String,
    pub cricket_scorecard: String,
    pub casino_data: String,
    pub casino_results: String,
    pub casino_tv: String,
}

impl Default for UpstreamPaths {
    fn default() -> Self {
        Self {
            cricket_odds: "cricket/odds/{id}".to_string(),
            cricket_scorecard: "cricket/scorecard/{id}".to_string(),
            casino_data: "casino/data/{id}".to_string(),
            casino_results: "casino/results/{id}".to_string(),
            casino_tv: "casino/tv/{id}".to_string(),
        }
    }
}

impl UpstreamPaths {
    pub fn template(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::CricketOdds => &self.cricket_odds,
            JobKind::CricketScorecard => &self.cricket_scorecard,
            JobKind::CasinoData => &self.casino_data,
            JobKind::CasinoResults => &self.casino_results,
            JobKind::CasinoTv => &self.casino_tv,
        }
    }
}

/// Connection settings for the upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Transport-level timeout. The gateway applies its own deadline on top.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub paths: UpstreamPaths,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            timeout: Duration::from_secs(10),
            user_agent: None,
            paths: UpstreamPaths::default(),
        }
    }
}

/// Source of raw upstream data for a job payload.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, payload: &JobPayload) -> Result<Value, UpstreamError>;
}

/// Receives data from successful fetches (cache, publish-on-change, ...).
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, payload: &JobPayload, data: Value);
}

/// Sink that only logs what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl ResultSink for TracingSink {
    async fn publish(&self, payload: &JobPayload, data: Value) {
        let size = match &data {
            Value::Array(items) => items.len(),
            Value::Object(fields) => fields.len(),
            _ => 1,
        };
        info!("Fetched {} ({} top-level entries)", payload, size);
    }
}

/// HTTP client for the odds and casino feeds.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: Url,
    paths: UpstreamPaths,
    timeout: Duration,
}

impl UpstreamClient {
    /// Build a client. Fails if the base URL is not an absolute http(s) URL.
    pub fn new(config: &UpstreamConfig) -> Result<Self, ConfigError> {
        let base_url = parse_base_url(&config.base_url)?;
        let user_agent = config.user_agent.as_deref().unwrap_or(USER_AGENT);

        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| ConfigError::InvalidUrl {
                url: config.base_url.clone(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        debug!("Upstream client for {} (timeout {:?})", base_url, config.timeout);

        Ok(Self {
            client,
            base_url,
            paths: config.paths.clone(),
            timeout: config.timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve the request URL for a payload.
    pub fn url_for(&self, payload: &JobPayload) -> Url {
        let mut url = self.base_url.clone();
        let template = self.paths.template(payload.kind());
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            for part in template.split('/').filter(|part| !part.is_empty()) {
                if part == "{id}" {
                    segments.push(payload.resource_id());
                } else {
                    segments.push(part);
                }
            }
        }
        url
    }

    pub async fn cricket_odds(&self, event_id: &str) -> Result<Value, UpstreamError> {
        self.fetch_payload(&JobPayload::new(JobKind::CricketOdds, event_id))
            .await
    }

    pub async fn cricket_scorecard(&self, event_id: &str) -> Result<Value, UpstreamError> {
        self.fetch_payload(&JobPayload::new(JobKind::CricketScorecard, event_id))
            .await
    }

    pub async fn casino_data(&self, game_type: &str) -> Result<Value, UpstreamError> {
        self.fetch_payload(&JobPayload::new(JobKind::CasinoData, game_type))
            .await
    }

    pub async fn casino_results(&self, game_type: &str) -> Result<Value, UpstreamError> {
        self.fetch_payload(&JobPayload::new(JobKind::CasinoResults, game_type))
            .await
    }

    pub async fn casino_tv(&self, stream_id: &str) -> Result<Value, UpstreamError> {
        self.fetch_payload(&JobPayload::new(JobKind::CasinoTv, stream_id))
            .await
    }

    async fn fetch_payload(&self, payload: &JobPayload) -> Result<Value, UpstreamError> {
        let url = self.url_for(payload);
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok()),
            );
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                message: error_message(status, &body),
                retry_after,
            });
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_decode() {
                UpstreamError::Decode(e.to_string())
            } else {
                self.transport_error(e)
            }
        })
    }

    fn transport_error(&self, error: reqwest::Error) -> UpstreamError {
        if error.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else {
            UpstreamError::Network(error.to_string())
        }
    }
}

#[async_trait]
impl Upstream for UpstreamClient {
    async fn fetch(&self, payload: &JobPayload) -> Result<Value, UpstreamError> {
        match payload {
            JobPayload::CricketOdds { event_id } => self.cricket_odds(event_id).await,
            JobPayload::CricketScorecard { event_id } => self.cricket_scorecard(event_id).await,
            JobPayload::CasinoData { game_type } => self.casino_data(game_type).await,
            JobPayload::CasinoResults { game_type } => self.casino_results(game_type).await,
            JobPayload::CasinoTv { stream_id } => self.casino_tv(stream_id).await,
        }
    }
}

/// Validate an upstream base URL.
pub fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidUrl {
        url: raw.to_string(),
        message,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.cannot_be_a_base() {
        return Err(invalid("not a base URL".to_string()));
    }
    Ok(url)
}

/// Short message for a failed response: trimmed body, or the status reason.
fn error_message(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("Unknown status")
            .to_string();
    }
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn client(base_url: &str) -> UpstreamClient {
        UpstreamClient::new(&UpstreamConfig {
            base_url: base_url.to_string(),
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap()
    }

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}/api", addr)
    }

    #[test]
    fn test_url_for_fills_id_segment() {
        let client = client("https://feeds.example.com/v2/");
        let url = client.url_for(&JobPayload::new(JobKind::CricketOdds, "1.2345"));
        assert_eq!(url.as_str(), "https://feeds.example.com/v2/cricket/odds/1.2345");

        let url = client.url_for(&JobPayload::new(JobKind::CasinoTv, "table 7/a"));
        assert_eq!(url.as_str(), "https://feeds.example.com/v2/casino/tv/table%207%2Fa");
    }

    #[test]
    fn test_custom_path_template() {
        let client = UpstreamClient::new(&UpstreamConfig {
            base_url: "https://feeds.example.com".to_string(),
            paths: UpstreamPaths {
                casino_results: "/results/{id}/latest".to_string(),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let url = client.url_for(&JobPayload::new(JobKind::CasinoResults, "teen20"));
        assert_eq!(url.as_str(), "https://feeds.example.com/results/teen20/latest");
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(matches!(
            parse_base_url("feeds.example.com"),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_base_url("ftp://feeds.example.com"),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(parse_base_url("http://localhost:9000").is_ok());
    }

    #[test]
    fn test_error_message() {
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, "  "), "Bad Gateway");
        assert_eq!(error_message(StatusCode::BAD_REQUEST, "bad id\n"), "bad id");
        let long = "x".repeat(500);
        assert_eq!(
            error_message(StatusCode::INTERNAL_SERVER_ERROR, &long).len(),
            MAX_ERROR_BODY + 3
        );
    }

    #[tokio::test]
    async fn test_429_maps_to_http_error_with_retry_after() {
        let base = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 7\r\nContent-Length: 9\r\nConnection: close\r\n\r\nslow down",
        )
        .await;

        let err = client(&base).cricket_odds("42").await.unwrap_err();
        assert_eq!(err.status_code(), Some(429));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.is_rate_limited());
        assert_eq!(err.to_string(), "HTTP 429: slow down");
    }

    #[tokio::test]
    async fn test_json_body_is_returned() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 27\r\nConnection: close\r\n\r\n{\"market\":\"1.2\",\"back\":1.9}",
        )
        .await;

        let data = client(&base)
            .fetch(&JobPayload::new(JobKind::CricketOdds, "1.2"))
            .await
            .unwrap();
        assert_eq!(data["market"], "1.2");
        assert_eq!(data["back"], 1.9);
    }

    #[tokio::test]
    async fn test_invalid_json_is_decode_error() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\nnot json",
        )
        .await;

        let err = client(&base).casino_data("lucky7").await.unwrap_err();
        assert!(matches!(err, UpstreamError::Decode(_)));
        assert!(!err.is_retryable());
    }
}
