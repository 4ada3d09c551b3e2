//! Render queue using Redis Streams.
//!
//! Layout in Redis:
//! - `stream_name`: ready occurrences, read through a consumer group
//! - `delayed_set`: retries waiting out their backoff, scored by due time (ms)
//! - `dlq_stream_name`: occurrences that exhausted their attempts
//! - `{prefix}:dedup:*`, `{prefix}:terminal:*`: short-lived bookkeeping keys

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadReply};
use redis::{AsyncCommands, Script};
use serde::Serialize;
use tracing::{debug, info, warn};

use vrender_models::encoding::{BACKOFF_MULTIPLIER, INITIAL_BACKOFF_MS, MAX_RETRIES};
use vrender_models::{JobError, JobId};

use crate::error::{QueueError, QueueResult};
use crate::job::{Delivery, RenderJob};

/// How long a job id stays reserved after enqueue.
const DEDUP_TTL_SECS: u64 = 3600;

/// Moves due retries from the delayed set onto the stream in one step, so
/// two workers promoting at once never duplicate an occurrence.
static PROMOTE_DUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
        for _, member in ipairs(due) do
            redis.call('ZREM', KEYS[1], member)
            redis.call('XADD', KEYS[2], '*', 'job', member)
        end
        return #due
        ",
    )
});

/// Parks an occurrence in the delayed set and acks its delivery in one step,
/// so a failed ack can never leave both a pending copy and a scheduled one.
static SCHEDULE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
        redis.call('XACK', KEYS[2], ARGV[3], ARGV[4])
        redis.call('XDEL', KEYS[2], ARGV[4])
        return 1
        ",
    )
});

/// Queue operations used to settle a delivery once its attempt is over.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Ack a finished delivery.
    async fn complete(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Ack a delivery that needed no work.
    async fn ack(&self, message_id: &str) -> QueueResult<()>;

    /// Schedule the next attempt and ack this one.
    async fn schedule_retry(&self, delivery: &Delivery) -> QueueResult<Duration>;

    /// Schedule this attempt again, carrying only its terminal failure.
    async fn defer_failure(&self, delivery: &Delivery, error: &JobError) -> QueueResult<Duration>;

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()>;

    /// Reset the delivery's idle time so no other consumer claims it.
    /// Returns false if the delivery is no longer pending.
    async fn extend_lease(&self, consumer_name: &str, message_id: &str) -> QueueResult<bool>;
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(INITIAL_BACKOFF_MS),
            multiplier: BACKOFF_MULTIPLIER,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows the `failures`-th failed attempt:
    /// `initial * multiplier^(failures - 1)`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial.saturating_mul(factor)
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for jobs
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter queue stream name
    pub dlq_stream_name: String,
    /// Sorted set holding scheduled retries
    pub delayed_set: String,
    /// Prefix for bookkeeping keys
    pub key_prefix: String,
    /// Total attempts allowed per job (first try included)
    pub max_retries: u32,
    /// Delay between attempts
    pub backoff: BackoffPolicy,
    /// How long a completed job's queue record is kept
    pub completed_retention: Duration,
    /// How long a failed job's queue record is kept
    pub failed_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "vrender:render".to_string(),
            consumer_group: "vrender:workers".to_string(),
            dlq_stream_name: "vrender:dlq".to_string(),
            delayed_set: "vrender:render:delayed".to_string(),
            key_prefix: "vrender".to_string(),
            max_retries: MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            completed_retention: Duration::from_secs(3600),
            failed_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let stream_name = std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name);
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            delayed_set: format!("{}:delayed", stream_name),
            stream_name,
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            key_prefix: defaults.key_prefix,
            max_retries: std::env::var("QUEUE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_retries),
            backoff: BackoffPolicy {
                initial: std::env::var("QUEUE_BACKOFF_INITIAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff.initial),
                multiplier: std::env::var("QUEUE_BACKOFF_MULTIPLIER")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.backoff.multiplier),
            },
            completed_retention: std::env::var("QUEUE_COMPLETED_RETENTION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.completed_retention),
            failed_retention: std::env::var("QUEUE_FAILED_RETENTION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.failed_retention),
        }
    }

    fn dedup_key(&self, idempotency_key: &str) -> String {
        format!("{}:dedup:{}", self.key_prefix, idempotency_key)
    }

    fn terminal_key(&self, job_id: &JobId) -> String {
        format!("{}:terminal:{}", self.key_prefix, job_id)
    }
}

/// Snapshot of queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// On the stream, not yet delivered
    pub waiting: u64,
    /// Delivered, not yet acknowledged
    pub pending: u64,
    /// Waiting out a retry backoff
    pub delayed: u64,
    /// In the dead letter stream
    pub dead_lettered: u64,
}

/// Short record kept after a job leaves the queue.
#[derive(Debug, Serialize)]
struct TerminalRecord<'a> {
    status: &'a str,
    attempts: u32,
    finished_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Job queue client.
pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Total attempts allowed per job.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    /// Initialize the queue (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        // Start at 0 so entries added before the group existed are delivered
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Check connectivity with a PING.
    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Enqueue the first occurrence of a job. Rejects a job id that was
    /// enqueued within the dedup window.
    pub async fn enqueue(&self, job: &RenderJob) -> QueueResult<String> {
        let mut conn = self.conn().await?;

        let idempotency_key = job.idempotency_key();
        let dedup_key = self.config.dedup_key(&idempotency_key);
        let reserved: Option<String> = redis::cmd("SET")
            .arg(&dedup_key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        if reserved.is_none() {
            warn!("Duplicate job rejected: {}", idempotency_key);
            return Err(QueueError::Duplicate(job.job_id.to_string()));
        }

        let message_id = match self.push(&mut conn, job).await {
            Ok(id) => id,
            Err(e) => {
                // Release the reservation so the caller can retry
                let _: Result<(), _> = conn.del(&dedup_key).await;
                return Err(e);
            }
        };

        info!("Enqueued job {} with message ID {}", job.job_id, message_id);
        Ok(message_id)
    }

    async fn push(&self, conn: &mut redis::aio::MultiplexedConnection, job: &RenderJob) -> QueueResult<String> {
        let payload = serde_json::to_string(job)?;
        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;
        Ok(message_id)
    }

    /// Read new deliveries for this consumer, blocking up to `block_ms`.
    pub async fn consume(&self, consumer_name: &str, block_ms: u64, count: usize) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn().await?;

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        let entries: Vec<StreamId> = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();
        Ok(self.accept_entries(entries, "Consumed").await)
    }

    /// Take over deliveries idle longer than `min_idle` (their worker most
    /// likely died mid-attempt).
    pub async fn claim_pending(
        &self,
        consumer_name: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn().await?;
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms as u64 >= min_idle_ms)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        // XCLAIM re-checks idle time, so a concurrent claimer wins cleanly
        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(min_idle_ms)
            .arg(&stale)
            .query_async(&mut conn)
            .await?;

        Ok(self.accept_entries(claimed.ids, "Claimed pending").await)
    }

    async fn accept_entries(&self, entries: Vec<StreamId>, verb: &str) -> Vec<Delivery> {
        let (deliveries, malformed) = parse_entries(entries);
        for d in &deliveries {
            debug!("{} job {} (attempt {})", verb, d.job.job_id, d.job.attempt_number());
        }
        for message_id in malformed {
            warn!("Dropping malformed stream entry {}", message_id);
            // Ack the malformed message to prevent reprocessing
            self.ack(&message_id).await.ok();
        }
        deliveries
    }

    /// Acknowledge a delivery and remove it from the stream.
    pub async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Acknowledged job: {}", message_id);
        Ok(())
    }

    /// Ack a finished delivery and keep a short completion record.
    pub async fn complete(&self, delivery: &Delivery) -> QueueResult<()> {
        self.ack(&delivery.message_id).await?;
        self.retain(&delivery.job, "completed", None, self.config.completed_retention)
            .await
    }

    /// Schedule the next attempt after the configured backoff and ack this
    /// delivery. Returns the delay applied.
    pub async fn schedule_retry(&self, delivery: &Delivery) -> QueueResult<Duration> {
        let next = delivery.job.next_attempt();
        let delay = self.config.backoff.delay_for(next.attempts_made);
        self.schedule(delivery, &next, delay).await?;

        info!(
            "Scheduled attempt {} of job {} in {}ms",
            next.attempt_number(),
            next.job_id,
            delay.as_millis()
        );
        Ok(delay)
    }

    /// Bring the same attempt back after a backoff with only its terminal
    /// failure left to persist.
    pub async fn defer_failure(&self, delivery: &Delivery, error: &JobError) -> QueueResult<Duration> {
        let deferred = delivery.job.with_pending_failure(error.clone());
        let delay = self.config.backoff.delay_for(deferred.attempt_number());
        self.schedule(delivery, &deferred, delay).await?;

        warn!(
            "Deferred terminal failure of job {} by {}ms",
            deferred.job_id,
            delay.as_millis()
        );
        Ok(delay)
    }

    async fn schedule(&self, delivery: &Delivery, occurrence: &RenderJob, delay: Duration) -> QueueResult<()> {
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let payload = serde_json::to_string(occurrence)?;

        let mut conn = self.conn().await?;
        SCHEDULE
            .key(&self.config.delayed_set)
            .key(&self.config.stream_name)
            .arg(due_ms)
            .arg(payload)
            .arg(&self.config.consumer_group)
            .arg(&delivery.message_id)
            .invoke_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Re-claim our own delivery with zero idle time, keeping it out of
    /// other consumers' `claim_pending`.
    pub async fn extend_lease(&self, consumer_name: &str, message_id: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(0)
            .arg(message_id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;
        Ok(!claimed.is_empty())
    }

    /// Move retries whose backoff has elapsed back onto the stream.
    pub async fn promote_due(&self, limit: usize) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let now_ms = Utc::now().timestamp_millis();

        let moved: usize = PROMOTE_DUE
            .key(&self.config.delayed_set)
            .key(&self.config.stream_name)
            .arg(now_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        if moved > 0 {
            debug!("Promoted {} delayed retries", moved);
        }
        Ok(moved)
    }

    /// Move a delivery to the dead letter queue.
    pub async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&delivery.job)?;

        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("error")
            .arg(error)
            .arg("original_id")
            .arg(&delivery.message_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack(&delivery.message_id).await?;
        self.retain(&delivery.job, "failed", Some(error), self.config.failed_retention)
            .await?;

        warn!("Moved job {} to DLQ: {}", delivery.job.job_id, error);
        Ok(())
    }

    async fn retain(&self, job: &RenderJob, status: &str, error: Option<&str>, ttl: Duration) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let record = TerminalRecord {
            status,
            attempts: job.attempt_number(),
            finished_at: Utc::now().to_rfc3339(),
            error,
        };
        conn.set_ex::<_, _, ()>(
            self.config.terminal_key(&job.job_id),
            serde_json::to_string(&record)?,
            ttl.as_secs().max(1),
        )
        .await?;
        Ok(())
    }

    /// Recently finished job record, if still within its retention window.
    pub async fn terminal_record(&self, job_id: &JobId) -> QueueResult<Option<serde_json::Value>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.config.terminal_key(job_id)).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(QueueError::from))
            .transpose()
    }

    /// Current queue depth.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn().await?;

        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        let pending: StreamPendingReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .query_async(&mut conn)
            .await?;
        let delayed: u64 = conn.zcard(&self.config.delayed_set).await?;
        let dead_lettered: u64 = conn.xlen(&self.config.dlq_stream_name).await?;

        let pending = pending.count() as u64;
        Ok(QueueStats {
            waiting: len.saturating_sub(pending),
            pending,
            delayed,
            dead_lettered,
        })
    }
}

#[async_trait]
impl DeliveryQueue for JobQueue {
    async fn complete(&self, delivery: &Delivery) -> QueueResult<()> {
        JobQueue::complete(self, delivery).await
    }

    async fn ack(&self, message_id: &str) -> QueueResult<()> {
        JobQueue::ack(self, message_id).await
    }

    async fn schedule_retry(&self, delivery: &Delivery) -> QueueResult<Duration> {
        JobQueue::schedule_retry(self, delivery).await
    }

    async fn defer_failure(&self, delivery: &Delivery, error: &JobError) -> QueueResult<Duration> {
        JobQueue::defer_failure(self, delivery, error).await
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
        JobQueue::dead_letter(self, delivery, error).await
    }

    async fn extend_lease(&self, consumer_name: &str, message_id: &str) -> QueueResult<bool> {
        JobQueue::extend_lease(self, consumer_name, message_id).await
    }
}

/// Split stream entries into parsed deliveries and unparseable message IDs.
fn parse_entries(entries: Vec<StreamId>) -> (Vec<Delivery>, Vec<String>) {
    let mut deliveries = Vec::new();
    let mut malformed = Vec::new();

    for entry in entries {
        let parsed = entry
            .get::<String>("job")
            .ok_or_else(|| QueueError::serialization("missing job field"))
            .and_then(|payload| serde_json::from_str::<RenderJob>(&payload).map_err(QueueError::from));

        match parsed {
            Ok(job) => deliveries.push(Delivery {
                message_id: entry.id,
                job,
            }),
            Err(e) => {
                warn!("Failed to parse job payload {}: {}", entry.id, e);
                malformed.push(entry.id);
            }
        }
    }

    (deliveries, malformed)
}
