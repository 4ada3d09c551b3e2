//! Webhook payloads sent on terminal transitions.

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::JobId;

/// Body POSTed to a job's callback URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WebhookPayload {
    Completed {
        #[serde(rename = "jobId")]
        job_id: JobId,
        #[serde(rename = "outputUrl")]
        output_url: String,
    },
    Failed {
        #[serde(rename = "jobId")]
        job_id: JobId,
        error: JobError,
    },
}

impl WebhookPayload {
    pub fn completed(job_id: &JobId, output_url: impl Into<String>) -> Self {
        Self::Completed {
            job_id: job_id.clone(),
            output_url: output_url.into(),
        }
    }

    pub fn failed(job_id: &JobId, error: JobError) -> Self {
        Self::Failed {
            job_id: job_id.clone(),
            error,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Completed { job_id, .. } | Self::Failed { job_id, .. } => job_id,
        }
    }
}
