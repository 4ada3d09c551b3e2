//! Structured job logging.

use tracing::{error, info, warn, Span};
use vrender_models::JobId;

/// Logs job lifecycle events with `job_id`, `operation` and `attempt` fields.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: String,
    attempt: u32,
}

impl JobLogger {
    /// Create a logger for one attempt of a job.
    pub fn new(job_id: &JobId, operation: &str, attempt: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation: operation.to_string(),
            attempt,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            attempt = self.attempt,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            attempt = self.attempt,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = %self.operation,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            operation = %self.operation,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            attempt = self.attempt,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span that wraps the whole attempt.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            operation = %self.operation,
            attempt = self.attempt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_creation() {
        let job_id = JobId::new();
        let logger = JobLogger::new(&job_id, "render", 2);

        assert_eq!(logger.job_id(), job_id.to_string());
        assert_eq!(logger.attempt(), 2);
    }
}
