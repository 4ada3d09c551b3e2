//! Job occurrences carried on the render stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vrender_models::{Job, JobError, JobId, Timeline};

/// One delivery-worth of work: the job plus how many attempts came before.
///
/// Each retry is a fresh occurrence with `attempts_made` one higher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderJob {
    /// Job record this occurrence belongs to
    pub job_id: JobId,
    /// Timeline to render
    pub timeline: Timeline,
    /// Webhook for the terminal transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Attempts already made before this one (0 on first delivery)
    #[serde(default)]
    pub attempts_made: u32,
    /// When this occurrence was put on the stream
    pub enqueued_at: DateTime<Utc>,
    /// Final failure whose terminal write still has to land; no render is
    /// attempted for such an occurrence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_failure: Option<JobError>,
}

impl RenderJob {
    pub fn new(job_id: JobId, timeline: Timeline, callback_url: Option<String>) -> Self {
        Self {
            job_id,
            timeline,
            callback_url,
            attempts_made: 0,
            enqueued_at: Utc::now(),
            pending_failure: None,
        }
    }

    /// First occurrence for a freshly created job record.
    pub fn from_job(job: &Job) -> Self {
        Self::new(job.id.clone(), job.timeline.clone(), job.callback_url.clone())
    }

    /// 1-based number of the attempt this occurrence represents.
    pub fn attempt_number(&self) -> u32 {
        self.attempts_made + 1
    }

    /// Whether no retry will follow if this attempt fails.
    pub fn is_last_attempt(&self, max_attempts: u32) -> bool {
        self.attempt_number() >= max_attempts
    }

    /// The occurrence scheduled after this one fails.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempts_made: self.attempts_made + 1,
            enqueued_at: Utc::now(),
            pending_failure: None,
            ..self.clone()
        }
    }

    /// The same attempt again, carrying only the terminal failure to persist.
    pub fn with_pending_failure(&self, error: JobError) -> Self {
        Self {
            enqueued_at: Utc::now(),
            pending_failure: Some(error),
            ..self.clone()
        }
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("render:{}", self.job_id)
    }
}

/// A job occurrence leased to this consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Stream entry ID, needed to ack
    pub message_id: String,
    pub job: RenderJob,
}
