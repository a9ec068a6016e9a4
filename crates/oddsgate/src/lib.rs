//! oddsgate - resilient access to rate-limited odds and casino feeds.
//!
//! Per-endpoint rate limiting, retry with backoff, a priority job queue and
//! the gateway that ties them together.

pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod job;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod service;
pub mod upstream;

pub use clock::{Clock, ManualClock, SharedClock, TokioClock};
pub use config::{Config, LoadOptions, Settings};
pub use error::{ConfigError, GatewayError, QueueError, UpstreamError};
pub use gateway::{ApiGateway, CallResult, CallStats};
pub use job::{Job, JobEvent, JobId, JobKind, JobPayload, JobSpec};
pub use queue::{JobProcessor, JobQueue, QueueConfig, QueueStats, QueueStatus};
pub use rate_limit::{EndpointLimits, EndpointStatus, RateDecision, RateLimiter, RejectReason};
pub use retry::{RetryConfig, RetryConfigUpdate, RetryPolicy};
pub use service::FeedService;
pub use upstream::{ResultSink, TracingSink, Upstream, UpstreamClient, UpstreamConfig};
