//! Render job record and lifecycle.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorCode, JobError};
use crate::timeline::Timeline;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
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

/// Externally observable job status.
///
/// Retries cycle through `Processing`; there is no separate retrying state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting in queue
    #[default]
    Queued,
    /// An attempt is running (or a retry is scheduled)
    Processing,
    /// Job rendered and uploaded
    Completed,
    /// Job exhausted its retries
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued | JobStatus::Processing, JobStatus::Processing) => true,
            (JobStatus::Processing, JobStatus::Completed) => true,
            (JobStatus::Queued | JobStatus::Processing, JobStatus::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Outcome of one failed attempt, kept alongside the terminal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    pub code: ErrorCode,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn from_error(attempt: u32, error: &JobError) -> Self {
        Self {
            attempt,
            code: error.code,
            message: error.message.clone(),
            at: Utc::now(),
        }
    }
}

/// A render job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Current lifecycle status
    #[serde(default)]
    pub status: JobStatus,

    /// Timeline to render
    pub timeline: Timeline,

    /// Webhook notified on the terminal transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    /// Time-limited URL of the rendered video
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,

    /// Terminal error (FAILED only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,

    /// Number of failed attempts recorded before the final outcome
    #[serde(default)]
    pub attempts: u32,

    /// Failed attempts in order. Never exposed by status queries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_history: Vec<AttemptRecord>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new QUEUED job with no attempts.
    pub fn new(timeline: Timeline, callback_url: Option<String>) -> Self {
        Self::with_id(JobId::new(), timeline, callback_url)
    }

    pub fn with_id(id: JobId, timeline: Timeline, callback_url: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Queued,
            timeline,
            callback_url,
            output_url: None,
            error: None,
            attempts: 0,
            attempt_history: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Begin an attempt (first try or retry).
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Processing)
    }

    /// Mark job as completed with its output URL.
    pub fn complete(&mut self, output_url: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Completed)?;
        self.output_url = Some(output_url.into());
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Mark job as failed on its final attempt.
    pub fn fail(&mut self, error: JobError) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error);
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Count a failed, non-final attempt. Status and error are untouched.
    pub fn record_failed_attempt(&mut self) -> Result<(), InvalidTransition> {
        if self.is_terminal() {
            return Err(InvalidTransition {
                from: self.status,
                to: JobStatus::Processing,
            });
        }
        self.attempts += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Build the status view returned to clients.
    pub fn status_view(&self) -> JobStatusResponse {
        JobStatusResponse::from(self)
    }
}

/// Job status as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            status: job.status,
            output_url: job.output_url.clone(),
            // Errors only become visible once the job has failed for good
            error: if job.status == JobStatus::Failed {
                job.error.clone()
            } else {
                None
            },
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}
