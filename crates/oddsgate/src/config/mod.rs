//! Configuration management for oddsgate using the prefer crate.
//!
//! Files hold optional overrides with durations in milliseconds. They are
//! overlaid onto `Settings::default()`, and `ODDSGATE_*` environment
//! variables win over both.

mod loader;
mod settings;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::rate_limit::EndpointLimits;
use crate::retry::RetryConfigUpdate;
use crate::upstream::{parse_base_url, UpstreamPaths};

pub use loader::{load_settings, LoadOptions};
pub use settings::Settings;

/// Name used for config file discovery (`oddsgate.toml`, `oddsgate.yaml`, ...).
pub const CONFIG_NAME: &str = "oddsgate";

/// Upstream connection section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<UpstreamPaths>,
}

/// Job queue section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_max_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

/// Rate limit overrides for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive_step_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_adaptive_delay_ms: Option<u64>,
}

impl EndpointSection {
    /// Overlay the fields that are set onto `limits`.
    pub fn apply(&self, limits: &mut EndpointLimits) {
        if let Some(ms) = self.window_ms {
            limits.window = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_requests {
            limits.max_requests = n;
        }
        if let Some(ms) = self.min_interval_ms {
            limits.min_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.backoff_ms {
            limits.backoff = Duration::from_millis(ms);
        }
        if let Some(adaptive) = self.adaptive {
            limits.adaptive = adaptive;
        }
        if let Some(ms) = self.adaptive_step_ms {
            limits.adaptive_step = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_adaptive_delay_ms {
            limits.max_adaptive_delay = Duration::from_millis(ms);
        }
    }

    /// Fully populated section describing `limits`.
    pub fn from_limits(limits: &EndpointLimits) -> Self {
        Self {
            window_ms: Some(limits.window.as_millis() as u64),
            max_requests: Some(limits.max_requests),
            min_interval_ms: Some(limits.min_interval.as_millis() as u64),
            backoff_ms: Some(limits.backoff.as_millis() as u64),
            adaptive: Some(limits.adaptive),
            adaptive_step_ms: Some(limits.adaptive_step.as_millis() as u64),
            max_adaptive_delay_ms: Some(limits.max_adaptive_delay.as_millis() as u64),
        }
    }

    pub fn to_limits(&self, base: &EndpointLimits) -> EndpointLimits {
        let mut limits = base.clone();
        self.apply(&mut limits);
        limits
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Hard deadline per upstream attempt, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub queue: QueueSection,
    /// Gateway retry policy.
    #[serde(default)]
    pub retry: RetryConfigUpdate,
    /// Limits for endpoints without their own entry.
    #[serde(default)]
    pub default_endpoint: EndpointSection,
    /// Per-endpoint overrides. Well-known endpoints start from their preset.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, EndpointSection>,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Discover and load the config file, or fall back to defaults.
    pub async fn load() -> Self {
        // Use prefer for file discovery, then parse with serde
        match prefer::load(CONFIG_NAME).await {
            Ok(pref_config) => {
                if let Some(path) = pref_config.source_path() {
                    match Self::load_from_path(path).await {
                        Ok(config) => config,
                        Err(e) => {
                            tracing::warn!("{}; using defaults", e);
                            Self::default()
                        }
                    }
                } else {
                    Self::default()
                }
            }
            Err(_) => {
                tracing::debug!("No {} config file found, using defaults", CONFIG_NAME);
                Self::default()
            }
        }
    }

    /// Load configuration from a specific file path.
    /// Supports JSON, TOML and YAML based on file extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let mut config = Self::parse(&contents, ext)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse config text in the format named by `ext`.
    pub fn parse(contents: &str, ext: &str) -> Result<Self, ConfigError> {
        match ext {
            "toml" => toml::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "TOML",
                message: e.to_string(),
            }),
            "yaml" | "yml" => serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "YAML",
                message: e.to_string(),
            }),
            _ => serde_json::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "JSON",
                message: e.to_string(),
            }),
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings) -> Result<(), ConfigError> {
        if let Some(ms) = self.request_timeout_ms {
            settings.request_timeout = Duration::from_millis(ms);
        }

        let upstream = &mut settings.upstream;
        if let Some(ref base_url) = self.upstream.base_url {
            parse_base_url(base_url)?;
            upstream.base_url = base_url.clone();
        }
        if let Some(ms) = self.upstream.timeout_ms {
            upstream.timeout = Duration::from_millis(ms);
        }
        if let Some(ref user_agent) = self.upstream.user_agent {
            upstream.user_agent = Some(user_agent.clone());
        }
        if let Some(ref paths) = self.upstream.paths {
            upstream.paths = paths.clone();
        }

        let queue = &mut settings.queue;
        let q = &self.queue;
        if let Some(n) = q.max_concurrent {
            queue.max_concurrent = n.max(1);
        }
        if let Some(n) = q.max_queue_size {
            queue.max_queue_size = n;
        }
        if let Some(p) = q.default_priority {
            queue.default_priority = p;
        }
        if let Some(n) = q.default_max_attempts {
            queue.default_max_attempts = n.max(1);
        }
        if let Some(ms) = q.base_retry_delay_ms {
            queue.base_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = q.max_retry_delay_ms {
            queue.max_retry_delay = Duration::from_millis(ms);
        }
        if let Some(m) = q.backoff_multiplier {
            queue.backoff_multiplier = m;
        }
        if let Some(jitter) = q.jitter {
            queue.jitter = jitter;
        }
        if let Some(ms) = q.jitter_max_ms {
            queue.jitter_max = Duration::from_millis(ms);
        }
        if let Some(ms) = q.poll_interval_ms {
            queue.poll_interval = Duration::from_millis(ms);
        }

        settings.retry.apply(&self.retry);

        self.default_endpoint.apply(&mut settings.default_endpoint);
        for (endpoint, section) in &self.endpoints {
            let base = settings
                .endpoints
                .get(endpoint)
                .cloned()
                .unwrap_or_else(|| settings.default_endpoint.clone());
            settings
                .endpoints
                .insert(endpoint.clone(), section.to_limits(&base));
        }

        if self.source_path.is_some() {
            settings.source_path = self.source_path.clone();
        }
        Ok(())
    }

    /// Fully populated config describing `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        let queue = &settings.queue;
        let retry = &settings.retry;
        Self {
            request_timeout_ms: Some(settings.request_timeout.as_millis() as u64),
            upstream: UpstreamSection {
                base_url: Some(settings.upstream.base_url.clone()),
                timeout_ms: Some(settings.upstream.timeout.as_millis() as u64),
                user_agent: settings.upstream.user_agent.clone(),
                paths: Some(settings.upstream.paths.clone()),
            },
            queue: QueueSection {
                max_concurrent: Some(queue.max_concurrent),
                max_queue_size: Some(queue.max_queue_size),
                default_priority: Some(queue.default_priority),
                default_max_attempts: Some(queue.default_max_attempts),
                base_retry_delay_ms: Some(queue.base_retry_delay.as_millis() as u64),
                max_retry_delay_ms: Some(queue.max_retry_delay.as_millis() as u64),
                backoff_multiplier: Some(queue.backoff_multiplier),
                jitter: Some(queue.jitter),
                jitter_max_ms: Some(queue.jitter_max.as_millis() as u64),
                poll_interval_ms: Some(queue.poll_interval.as_millis() as u64),
            },
            retry: RetryConfigUpdate {
                max_retries: Some(retry.max_retries),
                base_delay_ms: Some(retry.base_delay.as_millis() as u64),
                max_delay_ms: Some(retry.max_delay.as_millis() as u64),
                backoff_multiplier: Some(retry.backoff_multiplier),
                jitter: Some(retry.jitter),
                jitter_max_ms: Some(retry.jitter_max.as_millis() as u64),
            },
            default_endpoint: EndpointSection::from_limits(&settings.default_endpoint),
            endpoints: settings
                .endpoints
                .iter()
                .map(|(name, limits)| (name.clone(), EndpointSection::from_limits(limits)))
                .collect(),
            source_path: None,
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            format: "TOML",
            message: e.to_string(),
        })
    }
}
