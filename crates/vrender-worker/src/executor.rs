//! Job executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vrender_queue::{Delivery, DeliveryQueue, JobQueue};

use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::orchestrator::{AttemptOutcome, RenderOrchestrator};

/// Runs one delivery while holding its lease, then settles it on the queue.
pub struct DeliveryHandler {
    orchestrator: Arc<RenderOrchestrator>,
    queue: Arc<dyn DeliveryQueue>,
    consumer_name: String,
    lease_refresh: Duration,
}

impl DeliveryHandler {
    pub fn new(
        orchestrator: Arc<RenderOrchestrator>,
        queue: Arc<dyn DeliveryQueue>,
        consumer_name: impl Into<String>,
        lease_refresh: Duration,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            consumer_name: consumer_name.into(),
            lease_refresh,
        }
    }

    pub async fn handle(&self, delivery: Delivery) {
        let job_id = delivery.job.job_id.clone();
        info!(job_id = %job_id, "Executing attempt {}", delivery.job.attempt_number());

        let outcome = self.process_with_lease(&delivery).await;

        let settled = match outcome {
            AttemptOutcome::Completed { .. } => self.queue.complete(&delivery).await,
            AttemptOutcome::Skipped => self.queue.ack(&delivery.message_id).await,
            AttemptOutcome::Retry { error } => self.queue.schedule_retry(&delivery).await.map(|delay| {
                info!(
                    job_id = %job_id,
                    "Attempt {} failed ({}), retrying in {}ms",
                    delivery.job.attempt_number(),
                    error.code,
                    delay.as_millis()
                );
            }),
            AttemptOutcome::Failed { error } => self.queue.dead_letter(&delivery, &error.to_string()).await,
            AttemptOutcome::Unsettled { error } => {
                self.queue.defer_failure(&delivery, &error).await.map(|_| ())
            }
        };

        if let Err(e) = settled {
            // Left pending; the claim task redelivers it once it goes idle
            error!(job_id = %job_id, "Failed to settle delivery {}: {}", delivery.message_id, e);
        }
    }

    async fn process_with_lease(&self, delivery: &Delivery) -> AttemptOutcome {
        let work = self.orchestrator.process(&delivery.job);
        tokio::pin!(work);

        let mut heartbeat = interval_at(Instant::now() + self.lease_refresh, self.lease_refresh);
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = heartbeat.tick() => {
                    match self.queue.extend_lease(&self.consumer_name, &delivery.message_id).await {
                        Ok(true) => debug!(job_id = %delivery.job.job_id, "Extended lease on {}", delivery.message_id),
                        Ok(false) => warn!(job_id = %delivery.job.job_id, "Delivery {} is no longer pending", delivery.message_id),
                        Err(e) => warn!(job_id = %delivery.job.job_id, "Failed to extend lease: {}", e),
                    }
                }
            }
        }
    }
}

/// Pulls render occurrences off the queue and runs them with bounded
/// concurrency.
pub struct JobExecutor {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    handler: Arc<DeliveryHandler>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    pub fn new(config: WorkerConfig, queue: JobQueue, orchestrator: Arc<RenderOrchestrator>) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());
        let queue = Arc::new(queue);
        let handler = Arc::new(DeliveryHandler::new(
            orchestrator,
            Arc::clone(&queue) as Arc<dyn DeliveryQueue>,
            consumer_name.clone(),
            config.lease_refresh_interval(),
        ));

        Self {
            config,
            queue,
            handler,
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run until [`shutdown`](Self::shutdown) is called, then drain
    /// in-flight jobs.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.consumer_name, self.config.max_concurrent_jobs
        );

        self.queue.init().await?;

        let claim_task = self.spawn_claim_task();
        let promote_task = self.spawn_promote_task();

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    if let Err(e) = result {
                        error!("Error consuming jobs: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();
        promote_task.abort();

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!(
                "In-flight jobs still running after {}s; they will be reclaimed after restart",
                self.config.shutdown_timeout.as_secs()
            );
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Periodically take over deliveries orphaned by crashed workers.
    fn spawn_claim_task(&self) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let handler = Arc::clone(&self.handler);
        let semaphore = Arc::clone(&self.job_semaphore);
        let consumer_name = self.consumer_name.clone();
        let claim_interval = self.config.claim_interval;
        let min_idle = self.config.claim_min_idle;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(claim_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match queue.claim_pending(&consumer_name, min_idle, 5).await {
                            Ok(deliveries) if !deliveries.is_empty() => {
                                info!("Claimed {} pending jobs", deliveries.len());
                                for delivery in deliveries {
                                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                        break;
                                    };
                                    let handler = Arc::clone(&handler);
                                    tokio::spawn(async move {
                                        let _permit = permit;
                                        handler.handle(delivery).await;
                                    });
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Failed to claim pending jobs: {}", e),
                        }
                    }
                }
            }
        })
    }

    /// Periodically move retries whose backoff elapsed back onto the stream.
    fn spawn_promote_task(&self) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let promote_interval = self.config.promote_interval;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(promote_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = queue.promote_due(100).await {
                            warn!("Failed to promote delayed retries: {}", e);
                        }
                    }
                }
            }
        })
    }

    async fn consume_jobs(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .queue
            .consume(&self.consumer_name, 1000, available.min(5))
            .await?;
        if deliveries.is_empty() {
            return Ok(());
        }

        debug!("Consumed {} jobs from queue", deliveries.len());

        for delivery in deliveries {
            let Ok(permit) = self.job_semaphore.clone().acquire_owned().await else {
                warn!("Job semaphore closed; leaving {} pending", delivery.job.job_id);
                break;
            };
            let handler = Arc::clone(&self.handler);

            tokio::spawn(async move {
                let _permit = permit;
                handler.handle(delivery).await;
            });
        }

        Ok(())
    }

    async fn wait_for_jobs(&self) {
        loop {
            if self.job_semaphore.available_permits() == self.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use vrender_models::{ErrorCode, JobError, JobStatus};
    use vrender_queue::{QueueError, QueueResult, RenderJob};

    use crate::testing::{FakeStore, Harness, Step};

    /// Records every settling call as `action:message_id`.
    #[derive(Default)]
    struct RecordingQueue {
        actions: Mutex<Vec<String>>,
        leases: Mutex<u32>,
        fail_settle: bool,
    }

    impl RecordingQueue {
        fn record(&self, action: &str, message_id: &str) -> QueueResult<()> {
            if self.fail_settle {
                return Err(QueueError::connection_failed("connection refused"));
            }
            self.actions.lock().unwrap().push(format!("{}:{}", action, message_id));
            Ok(())
        }

        fn actions(&self) -> Vec<String> {
            self.actions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryQueue for RecordingQueue {
        async fn complete(&self, delivery: &Delivery) -> QueueResult<()> {
            self.record("complete", &delivery.message_id)
        }

        async fn ack(&self, message_id: &str) -> QueueResult<()> {
            self.record("ack", message_id)
        }

        async fn schedule_retry(&self, delivery: &Delivery) -> QueueResult<Duration> {
            self.record("retry", &delivery.message_id)?;
            Ok(Duration::from_millis(1000))
        }

        async fn defer_failure(&self, delivery: &Delivery, error: &JobError) -> QueueResult<Duration> {
            self.record(&format!("defer({})", error.code), &delivery.message_id)?;
            Ok(Duration::from_millis(1000))
        }

        async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
            assert!(!error.is_empty());
            self.record("dead_letter", &delivery.message_id)
        }

        async fn extend_lease(&self, _consumer_name: &str, _message_id: &str) -> QueueResult<bool> {
            *self.leases.lock().unwrap() += 1;
            Ok(true)
        }
    }

    fn handler(h: &Harness, queue: &Arc<RecordingQueue>, lease_refresh: Duration) -> DeliveryHandler {
        DeliveryHandler::new(
            Arc::clone(&h.orchestrator),
            Arc::clone(queue) as Arc<dyn DeliveryQueue>,
            "worker-test",
            lease_refresh,
        )
    }

    fn delivery(id: &str, job: RenderJob) -> Delivery {
        Delivery {
            message_id: id.to_string(),
            job,
        }
    }

    #[tokio::test]
    async fn test_outcomes_map_to_queue_actions() {
        let h = Harness::new(
            vec![Step::Exit("Invalid data found"), Step::Exit("Invalid data found"), Step::Timeout],
            FakeStore::default(),
        );
        let queue = Arc::new(RecordingQueue::default());
        let handler = handler(&h, &queue, Duration::from_secs(60));
        let job = h.submit("https://img.example.com/a.jpg", None).await;

        let first = RenderJob::from_job(&job);
        handler.handle(delivery("1-0", first.clone())).await;
        handler.handle(delivery("2-0", first.next_attempt())).await;
        handler.handle(delivery("3-0", first.next_attempt().next_attempt())).await;
        // Redelivered after the job went terminal
        handler.handle(delivery("4-0", first.clone())).await;

        assert_eq!(queue.actions(), vec!["retry:1-0", "retry:2-0", "dead_letter:3-0", "ack:4-0"]);
        assert_eq!(h.stored(&job.id).await.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_completed_attempt_is_completed_on_queue() {
        let h = Harness::new(vec![Step::Succeed], FakeStore::default());
        let queue = Arc::new(RecordingQueue::default());
        let job = h.submit("https://img.example.com/a.jpg", None).await;

        handler(&h, &queue, Duration::from_secs(60))
            .handle(delivery("7-0", RenderJob::from_job(&job)))
            .await;

        assert_eq!(queue.actions(), vec!["complete:7-0"]);
    }

    #[tokio::test]
    async fn test_failed_terminal_write_is_deferred_not_dead_lettered() {
        let h = Harness::with_max_attempts(vec![Step::Timeout], FakeStore::default(), 1);
        h.jobs.fail_mark_failed(1);
        let queue = Arc::new(RecordingQueue::default());
        let job = h.submit("https://img.example.com/a.jpg", None).await;

        handler(&h, &queue, Duration::from_secs(60))
            .handle(delivery("9-0", RenderJob::from_job(&job)))
            .await;

        assert_eq!(
            queue.actions(),
            vec![format!("defer({}):9-0", ErrorCode::FfmpegTimeout)]
        );
        assert_eq!(h.stored(&job.id).await.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_long_attempt_keeps_extending_its_lease() {
        let h = Harness::new(vec![Step::Slow(Duration::from_millis(300))], FakeStore::default());
        let queue = Arc::new(RecordingQueue::default());
        let job = h.submit("https://img.example.com/a.jpg", None).await;

        handler(&h, &queue, Duration::from_millis(50))
            .handle(delivery("5-0", RenderJob::from_job(&job)))
            .await;

        assert!(*queue.leases.lock().unwrap() >= 3);
        assert_eq!(queue.actions(), vec!["complete:5-0"]);
    }

    #[tokio::test]
    async fn test_settle_failure_is_swallowed() {
        let h = Harness::new(vec![Step::Succeed], FakeStore::default());
        let queue = Arc::new(RecordingQueue {
            fail_settle: true,
            ..RecordingQueue::default()
        });
        let job = h.submit("https://img.example.com/a.jpg", None).await;

        handler(&h, &queue, Duration::from_secs(60))
            .handle(delivery("6-0", RenderJob::from_job(&job)))
            .await;

        assert!(queue.actions().is_empty());
        assert_eq!(h.stored(&job.id).await.status, JobStatus::Completed);
    }
}
