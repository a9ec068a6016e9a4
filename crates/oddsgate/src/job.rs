//! Job model: what gets queued, and the events emitted as it moves through the queue.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque job identifier, assigned at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upstream resource a job fetches. Selects the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    CricketOdds,
    CricketScorecard,
    CasinoData,
    CasinoResults,
    CasinoTv,
}

impl JobKind {
    pub fn all() -> &'static [JobKind] {
        &[
            Self::CricketOdds,
            Self::CricketScorecard,
            Self::CasinoData,
            Self::CasinoResults,
            Self::CasinoTv,
        ]
    }

    /// Key used for logging and as the default rate limiter endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CricketOdds => "cricket_odds",
            Self::CricketScorecard => "cricket_scorecard",
            Self::CasinoData => "casino_data",
            Self::CasinoResults => "casino_results",
            Self::CasinoTv => "casino_tv",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown job kind: {}", s))
    }
}

/// Typed payload for each job kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    CricketOdds { event_id: String },
    CricketScorecard { event_id: String },
    CasinoData { game_type: String },
    CasinoResults { game_type: String },
    CasinoTv { stream_id: String },
}

impl JobPayload {
    /// Build a payload for `kind` from its single identifier.
    pub fn new(kind: JobKind, id: impl Into<String>) -> Self {
        let id = id.into();
        match kind {
            JobKind::CricketOdds => Self::CricketOdds { event_id: id },
            JobKind::CricketScorecard => Self::CricketScorecard { event_id: id },
            JobKind::CasinoData => Self::CasinoData { game_type: id },
            JobKind::CasinoResults => Self::CasinoResults { game_type: id },
            JobKind::CasinoTv => Self::CasinoTv { stream_id: id },
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Self::CricketOdds { .. } => JobKind::CricketOdds,
            Self::CricketScorecard { .. } => JobKind::CricketScorecard,
            Self::CasinoData { .. } => JobKind::CasinoData,
            Self::CasinoResults { .. } => JobKind::CasinoResults,
            Self::CasinoTv { .. } => JobKind::CasinoTv,
        }
    }

    /// The event id, game type or stream id carried by the payload.
    pub fn resource_id(&self) -> &str {
        match self {
            Self::CricketOdds { event_id } | Self::CricketScorecard { event_id } => event_id,
            Self::CasinoData { game_type } | Self::CasinoResults { game_type } => game_type,
            Self::CasinoTv { stream_id } => stream_id,
        }
    }
}

impl fmt::Display for JobPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.resource_id())
    }
}

/// Caller-side description of a job to enqueue.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub payload: JobPayload,
    /// Lower is served first. Queue default when `None`.
    pub priority: Option<i32>,
    /// Queue default when `None`.
    pub max_attempts: Option<u32>,
    /// Hold the job back for this long after enqueue.
    pub delay: Option<Duration>,
}

impl JobSpec {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            priority: None,
            max_attempts: None,
            delay: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl From<JobPayload> for JobSpec {
    fn from(payload: JobPayload) -> Self {
        Self::new(payload)
    }
}

/// A queued unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: i32,
    /// Attempts made so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: Instant,
    /// Not dispatched before this instant.
    pub ready_at: Instant,
    /// Wall-clock enqueue time, for display.
    pub enqueued_at: DateTime<Utc>,
    /// Enqueue order; breaks ties between equal priorities.
    pub sequence: u64,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.ready_at <= now
    }
}

/// Lifecycle notifications published by the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Enqueued {
        id: JobId,
        kind: JobKind,
        priority: i32,
    },
    Dispatched {
        id: JobId,
        kind: JobKind,
        attempt: u32,
        waited: Duration,
    },
    Completed {
        id: JobId,
        kind: JobKind,
        attempts: u32,
    },
    Retrying {
        id: JobId,
        kind: JobKind,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Failed {
        id: JobId,
        kind: JobKind,
        attempts: u32,
        error: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Enqueued { id, .. }
            | Self::Dispatched { id, .. }
            | Self::Completed { id, .. }
            | Self::Retrying { id, .. }
            | Self::Failed { id, .. } => *id,
        }
    }

    /// Completed or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}
