//! Render orchestrator.
//!
//! Drives one job occurrence through compile, encode, upload and notify,
//! applies the retry policy, and always removes the attempt's workspace.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn, Instrument};

use vrender_media::{remove_workspace, RenderRunner, TimelineCompiler};
use vrender_models::encoding::{output_key, JOB_TIMEOUT_MS, MAX_RETRIES, OUTPUT_CONTENT_TYPE, SIGNED_URL_TTL_SECS};
use vrender_models::{AttemptRecord, JobError, WebhookPayload};
use vrender_queue::{JobRepository, RenderJob, Transition};
use vrender_storage::ObjectStore;

use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::notifier::Notifier;

/// What the queue should do with the occurrence that was just processed.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Job is COMPLETED
    Completed { output_url: String },
    /// Attempt failed but attempts remain; schedule the next one
    Retry { error: JobError },
    /// Final attempt failed; job is FAILED
    Failed { error: JobError },
    /// Final attempt failed but the FAILED write did not land. The
    /// occurrence must come back so the terminal write is retried.
    Unsettled { error: JobError },
    /// Job was already terminal; nothing was done
    Skipped,
}

enum Finished {
    Rendered(String),
    AlreadyTerminal,
}

/// Collaborators and limits for the render pipeline.
pub struct RenderOrchestrator {
    compiler: TimelineCompiler,
    runner: Arc<dyn RenderRunner>,
    store: Arc<dyn ObjectStore>,
    jobs: Arc<dyn JobRepository>,
    notifier: Arc<dyn Notifier>,
    job_timeout: Duration,
    signed_url_ttl: Duration,
    max_attempts: u32,
}

impl RenderOrchestrator {
    pub fn new(
        compiler: TimelineCompiler,
        runner: Arc<dyn RenderRunner>,
        store: Arc<dyn ObjectStore>,
        jobs: Arc<dyn JobRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            compiler,
            runner,
            store,
            jobs,
            notifier,
            job_timeout: Duration::from_millis(JOB_TIMEOUT_MS),
            signed_url_ttl: Duration::from_secs(SIGNED_URL_TTL_SECS),
            max_attempts: MAX_RETRIES,
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_signed_url_ttl(mut self, ttl: Duration) -> Self {
        self.signed_url_ttl = ttl;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Process one delivered occurrence. Never returns an error: every
    /// failure is folded into the outcome.
    pub async fn process(&self, job: &RenderJob) -> AttemptOutcome {
        let logger = JobLogger::new(&job.job_id, "render", job.attempt_number());
        let span = logger.create_span();

        if let Some(error) = &job.pending_failure {
            // The render already failed for good; only the terminal write is left
            return async {
                logger.log_warning("retrying terminal failure write");
                self.finalize_failure(job, error.clone()).await
            }
            .instrument(span)
            .await;
        }

        async {
            logger.log_start(&format!(
                "attempt {}/{} ({} clips)",
                job.attempt_number(),
                self.max_attempts,
                job.timeline.len()
            ));

            let result = self.run_attempt(job, &logger).await;

            let outcome = match result {
                Ok(Finished::Rendered(output_url)) => self.on_success(job, &logger, output_url).await,
                Ok(Finished::AlreadyTerminal) => {
                    logger.log_warning("job already finished, skipping redelivered occurrence");
                    AttemptOutcome::Skipped
                }
                Err(e) => self.on_failure(job, &logger, e).await,
            };

            // Runs on every path, including failures before the workspace existed
            remove_workspace(&self.compiler.work_dir_for(&job.job_id)).await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_attempt(&self, job: &RenderJob, logger: &JobLogger) -> WorkerResult<Finished> {
        if self.jobs.mark_processing(&job.job_id).await? == Transition::AlreadyTerminal {
            return Ok(Finished::AlreadyTerminal);
        }

        let compiled = self.compiler.compile(&job.job_id, &job.timeline).await?;
        logger.log_progress(&format!(
            "compiled {} inputs into {}",
            compiled.input_asset_paths.len(),
            compiled.work_dir.display()
        ));

        let report = self.runner.run(&compiled.command, self.job_timeout).await;
        if let Some(ms) = report.duration_ms {
            metrics::record_ffmpeg_duration(ms, report.success());
        }
        if let Some(failure) = report.failure {
            return Err(WorkerError::Render(failure));
        }
        logger.log_progress("encode finished");

        let key = output_key(job.job_id.as_str());
        self.store
            .upload_file(&report.output_path, &key, OUTPUT_CONTENT_TYPE)
            .await?;
        let output_url = self.store.signed_url(&key, self.signed_url_ttl).await?;
        logger.log_progress(&format!("uploaded {}", key));

        match self.jobs.mark_completed(&job.job_id, &output_url).await? {
            Transition::Applied => Ok(Finished::Rendered(output_url)),
            Transition::AlreadyTerminal => Ok(Finished::AlreadyTerminal),
        }
    }

    async fn on_success(&self, job: &RenderJob, logger: &JobLogger, output_url: String) -> AttemptOutcome {
        metrics::record_job_completed();
        logger.log_completion(&output_url);

        if let Some(callback_url) = &job.callback_url {
            let payload = WebhookPayload::completed(&job.job_id, output_url.clone());
            self.notifier.notify(callback_url, &payload).await;
        }

        AttemptOutcome::Completed { output_url }
    }

    async fn on_failure(&self, job: &RenderJob, logger: &JobLogger, err: WorkerError) -> AttemptOutcome {
        let error = err.to_job_error();
        logger.log_error(&error.to_string());

        let attempt = job.attempt_number();
        if let Err(e) = self
            .jobs
            .record_attempt(&job.job_id, &AttemptRecord::from_error(attempt, &error))
            .await
        {
            warn!(job_id = %job.job_id, "Failed to record attempt {}: {}", attempt, e);
        }

        if !job.is_last_attempt(self.max_attempts) {
            // Intermediate failures stay invisible: no status change, no error, no webhook
            match self.jobs.increment_attempts(&job.job_id).await {
                Ok(n) => debug!(job_id = %job.job_id, "Recorded failed attempt ({} so far)", n),
                Err(e) => warn!(job_id = %job.job_id, "Failed to increment attempts: {}", e),
            }
            metrics::record_job_retry(error.code);
            return AttemptOutcome::Retry { error };
        }

        self.finalize_failure(job, error).await
    }

    /// Persist the terminal FAILED state and notify once it is applied.
    async fn finalize_failure(&self, job: &RenderJob, error: JobError) -> AttemptOutcome {
        match self.jobs.mark_failed(&job.job_id, &error).await {
            Ok(Transition::Applied) => {
                metrics::record_job_failed(error.code);
                if let Some(callback_url) = &job.callback_url {
                    let payload = WebhookPayload::failed(&job.job_id, error.clone());
                    self.notifier.notify(callback_url, &payload).await;
                }
                AttemptOutcome::Failed { error }
            }
            Ok(Transition::AlreadyTerminal) => {
                warn!(job_id = %job.job_id, "Job already terminal; failure not recorded");
                AttemptOutcome::Failed { error }
            }
            Err(e) => {
                error!(job_id = %job.job_id, "Failed to mark job failed: {}", e);
                AttemptOutcome::Unsettled { error }
            }
        }
    }
}
