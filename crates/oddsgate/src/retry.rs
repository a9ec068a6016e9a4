//! Retry eligibility and exponential backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;

/// Retry tuning shared by the gateway and the job queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add a uniform random component to each delay.
    pub jitter: bool,
    /// Upper bound of the random component.
    pub jitter_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            jitter_max: Duration::from_secs(1),
        }
    }
}

/// Partial update for `RetryConfig`; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_max_ms: Option<u64>,
}

impl RetryConfig {
    pub fn apply(&mut self, update: &RetryConfigUpdate) {
        if let Some(max_retries) = update.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(ms) = update.base_delay_ms {
            self.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = update.max_delay_ms {
            self.max_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = update.backoff_multiplier {
            self.backoff_multiplier = multiplier;
        }
        if let Some(jitter) = update.jitter {
            self.jitter = jitter;
        }
        if let Some(ms) = update.jitter_max_ms {
            self.jitter_max = Duration::from_millis(ms);
        }
    }
}

/// Pure retry decisions over a `RetryConfig`.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn update(&mut self, update: &RetryConfigUpdate) {
        self.config.apply(update);
    }

    /// Total attempts allowed for one call.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    /// Deterministic part of the delay after failed attempt `attempt` (1-indexed).
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.config.backoff_multiplier.max(1.0).powi(exponent);
        let ms = self.config.base_delay.as_millis() as f64 * factor;
        let capped = ms.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay after failed attempt `attempt` (1-indexed), jitter included, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        let jitter = if self.config.jitter && !self.config.jitter_max.is_zero() {
            let ceiling = self.config.jitter_max.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.config.max_delay)
    }

    /// Whether a call that failed with `error` on attempt `attempt` (1-indexed) may try again.
    pub fn should_retry(&self, attempt: u32, error: &UpstreamError) -> bool {
        attempt < self.max_attempts() && error.is_retryable()
    }
}
