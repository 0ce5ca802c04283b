//! Database models for the coordination store.

use serde::{Deserialize, Serialize};

/// Lifecycle of a job as seen by progress observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether no further progress will be published under this status.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of one job, keyed by the caller's progress key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub status: JobStatus,
    /// Human-readable stage label ("load", "export", ...).
    pub stage: String,
    pub total: u64,
    pub completed: u64,
    /// Estimated seconds remaining.
    pub eta_secs: u64,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self {
            status: JobStatus::Queued,
            stage: "load".to_string(),
            total: 100,
            completed: 0,
            eta_secs: 0,
        }
    }
}

impl JobProgress {
    pub fn running(stage: impl Into<String>, completed: u64, total: u64) -> Self {
        Self {
            status: JobStatus::Running,
            stage: stage.into(),
            total,
            completed,
            eta_secs: 0,
        }
    }

    #[must_use]
    pub const fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub const fn with_eta(mut self, eta_secs: u64) -> Self {
        self.eta_secs = eta_secs;
        self
    }
}

/// Outcome of an atomic publish-unless-stopped write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Progress was written.
    Published,
    /// A stop marker was present; it was consumed and nothing was written.
    Aborted,
}

/// Lock record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LockRecord {
    pub name: String,
    pub token: String,
    pub expires_at_ms: i64,
}

/// Progress record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProgressRecord {
    pub key: String,
    pub status: String,
    pub stage: String,
    pub total: i64,
    pub completed: i64,
    pub eta_secs: i64,
    pub updated_at: i64,
}

impl ProgressRecord {
    /// Convert to the domain type; `None` if the stored status is unknown.
    pub fn into_progress(self) -> Option<JobProgress> {
        Some(JobProgress {
            status: JobStatus::parse(&self.status)?,
            stage: self.stage,
            total: u64::try_from(self.total).unwrap_or_default(),
            completed: u64::try_from(self.completed).unwrap_or_default(),
            eta_secs: u64::try_from(self.eta_secs).unwrap_or_default(),
        })
    }
}
