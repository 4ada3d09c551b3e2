//! Job record persistence.
//!
//! Each job is one Redis hash (`{prefix}:job:{id}`) plus a list of attempt
//! records (`{prefix}:job:{id}:attempts`). Status changes go through Lua
//! scripts so the terminal check and the write happen atomically.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;
use tracing::debug;

use vrender_models::{AttemptRecord, InvalidTransition, Job, JobError, JobId, JobStatus, Timeline};

use crate::error::{QueueError, QueueResult};

/// Result of a status-conditioned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The write happened
    Applied,
    /// The job had already finished; nothing was changed
    AlreadyTerminal,
}

/// Persistence contract for job records.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job record. Fails if the id is taken.
    async fn create(&self, job: &Job) -> QueueResult<()>;

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>>;

    /// Enter PROCESSING at the start of an attempt.
    async fn mark_processing(&self, id: &JobId) -> QueueResult<Transition>;

    /// Atomically bump the failed-attempt counter, returning the new value.
    async fn increment_attempts(&self, id: &JobId) -> QueueResult<u32>;

    /// Append one failed attempt to the job's history.
    async fn record_attempt(&self, id: &JobId, record: &AttemptRecord) -> QueueResult<()>;

    async fn mark_completed(&self, id: &JobId, output_url: &str) -> QueueResult<Transition>;

    async fn mark_failed(&self, id: &JobId, error: &JobError) -> QueueResult<Transition>;
}

static CREATE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
        redis.call('HSET', KEYS[1], unpack(ARGV))
        return 1
        ",
    )
});

// Returns 1 applied, 0 already terminal, -1 missing, -2 illegal source state.
static TRANSITION: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local status = redis.call('HGET', KEYS[1], 'status')
        if not status then return -1 end
        if status == 'completed' or status == 'failed' then return 0 end
        if ARGV[1] == 'completed' and status ~= 'processing' then return -2 end
        redis.call('HSET', KEYS[1], 'status', ARGV[1], 'updatedAt', ARGV[2])
        if ARGV[1] == 'completed' or ARGV[1] == 'failed' then
            redis.call('HSET', KEYS[1], 'completedAt', ARGV[2])
        end
        for i = 3, #ARGV, 2 do
            redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
        end
        return 1
        ",
    )
});

// Returns the new count, -1 missing, -2 completed, -3 failed.
static INCREMENT_ATTEMPTS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local status = redis.call('HGET', KEYS[1], 'status')
        if not status then return -1 end
        if status == 'completed' then return -2 end
        if status == 'failed' then return -3 end
        redis.call('HSET', KEYS[1], 'updatedAt', ARGV[1])
        return redis.call('HINCRBY', KEYS[1], 'attempts', 1)
        ",
    )
});

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(field: &str, value: &str) -> QueueResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QueueError::serialization(format!("bad {}: {}", field, e)))
}

/// Flatten a job into hash fields. Attempt history lives in its own list.
fn job_to_fields(job: &Job) -> QueueResult<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("id", job.id.to_string()),
        ("status", job.status.as_str().to_string()),
        ("timeline", serde_json::to_string(&job.timeline)?),
        ("attempts", job.attempts.to_string()),
        ("createdAt", timestamp(job.created_at)),
        ("updatedAt", timestamp(job.updated_at)),
    ];
    if let Some(url) = &job.callback_url {
        fields.push(("callbackUrl", url.clone()));
    }
    if let Some(url) = &job.output_url {
        fields.push(("outputUrl", url.clone()));
    }
    if let Some(error) = &job.error {
        fields.push(("error", serde_json::to_string(error)?));
    }
    if let Some(at) = job.completed_at {
        fields.push(("completedAt", timestamp(at)));
    }
    Ok(fields)
}

fn job_from_fields(mut fields: HashMap<String, String>, history: &[String]) -> QueueResult<Job> {
    let mut take = |name: &str| fields.remove(name);
    let required = |name: &str, value: Option<String>| {
        value.ok_or_else(|| QueueError::serialization(format!("job record missing {}", name)))
    };

    let id = required("id", take("id"))?;
    let status_raw = required("status", take("status"))?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| QueueError::serialization(format!("unknown status {}", status_raw)))?;
    let timeline: Timeline = serde_json::from_str(&required("timeline", take("timeline"))?)?;
    let attempts = take("attempts")
        .map(|a| a.parse::<u32>())
        .transpose()
        .map_err(|e| QueueError::serialization(format!("bad attempts: {}", e)))?
        .unwrap_or(0);
    let created_at = parse_timestamp("createdAt", &required("createdAt", take("createdAt"))?)?;
    let updated_at = parse_timestamp("updatedAt", &required("updatedAt", take("updatedAt"))?)?;
    let completed_at = take("completedAt")
        .map(|v| parse_timestamp("completedAt", &v))
        .transpose()?;
    let error = take("error")
        .map(|v| serde_json::from_str::<JobError>(&v))
        .transpose()?;
    let callback_url = take("callbackUrl");
    let output_url = take("outputUrl");

    let attempt_history = history
        .iter()
        .map(|r| serde_json::from_str::<AttemptRecord>(r))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Job {
        id: JobId::from_string(id),
        status,
        timeline,
        callback_url,
        output_url,
        error,
        attempts,
        attempt_history,
        created_at,
        updated_at,
        completed_at,
    })
}

/// Redis-backed job records.
pub struct RedisJobStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisJobStore {
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            key_prefix: "vrender".to_string(),
        })
    }

    /// Create from `REDIS_URL`.
    pub fn from_env() -> QueueResult<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        Self::new(&url)
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.key_prefix, id)
    }

    fn attempts_key(&self, id: &JobId) -> String {
        format!("{}:job:{}:attempts", self.key_prefix, id)
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    async fn transition(
        &self,
        id: &JobId,
        to: JobStatus,
        extra: &[(&str, String)],
    ) -> QueueResult<Transition> {
        let mut conn = self.conn().await?;
        let mut invocation = TRANSITION.key(self.job_key(id));
        invocation.arg(to.as_str()).arg(timestamp(Utc::now()));
        for (field, value) in extra {
            invocation.arg(*field).arg(value);
        }

        let code: i64 = invocation.invoke_async(&mut conn).await?;
        match code {
            1 => {
                debug!(job_id = %id, "Job -> {}", to);
                Ok(Transition::Applied)
            }
            0 => Ok(Transition::AlreadyTerminal),
            -1 => Err(QueueError::JobNotFound(id.to_string())),
            _ => Err(InvalidTransition {
                from: JobStatus::Queued,
                to,
            }
            .into()),
        }
    }
}

#[async_trait]
impl JobRepository for RedisJobStore {
    async fn create(&self, job: &Job) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut invocation = CREATE.key(self.job_key(&job.id));
        for (field, value) in job_to_fields(job)? {
            invocation.arg(field).arg(value);
        }

        let created: i64 = invocation.invoke_async(&mut conn).await?;
        if created == 0 {
            return Err(QueueError::Duplicate(job.id.to_string()));
        }
        for record in &job.attempt_history {
            self.record_attempt(&job.id, record).await?;
        }
        Ok(())
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let history: Vec<String> = conn.lrange(self.attempts_key(id), 0, -1).await?;
        job_from_fields(fields, &history).map(Some)
    }

    async fn mark_processing(&self, id: &JobId) -> QueueResult<Transition> {
        self.transition(id, JobStatus::Processing, &[]).await
    }

    async fn increment_attempts(&self, id: &JobId) -> QueueResult<u32> {
        let mut conn = self.conn().await?;
        let count: i64 = INCREMENT_ATTEMPTS
            .key(self.job_key(id))
            .arg(timestamp(Utc::now()))
            .invoke_async(&mut conn)
            .await?;

        match count {
            -1 => Err(QueueError::JobNotFound(id.to_string())),
            -2 | -3 => Err(InvalidTransition {
                from: if count == -2 { JobStatus::Completed } else { JobStatus::Failed },
                to: JobStatus::Processing,
            }
            .into()),
            n => Ok(n as u32),
        }
    }

    async fn record_attempt(&self, id: &JobId, record: &AttemptRecord) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.rpush::<_, _, ()>(self.attempts_key(id), serde_json::to_string(record)?)
            .await?;
        Ok(())
    }

    async fn mark_completed(&self, id: &JobId, output_url: &str) -> QueueResult<Transition> {
        self.transition(id, JobStatus::Completed, &[("outputUrl", output_url.to_string())])
            .await
    }

    async fn mark_failed(&self, id: &JobId, error: &JobError) -> QueueResult<Transition> {
        self.transition(id, JobStatus::Failed, &[("error", serde_json::to_string(error)?)])
            .await
    }
}

/// In-process job records, for local runs and tests.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<T>(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut Job) -> QueueResult<T> + Send,
    ) -> QueueResult<T> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        f(job)
    }
}

#[async_trait]
impl JobRepository for MemoryJobStore {
    async fn create(&self, job: &Job) -> QueueResult<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(QueueError::Duplicate(job.id.to_string()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn mark_processing(&self, id: &JobId) -> QueueResult<Transition> {
        self.update(id, |job| {
            if job.is_terminal() {
                return Ok(Transition::AlreadyTerminal);
            }
            job.start()?;
            Ok(Transition::Applied)
        })
        .await
    }

    async fn increment_attempts(&self, id: &JobId) -> QueueResult<u32> {
        self.update(id, |job| {
            job.record_failed_attempt()?;
            Ok(job.attempts)
        })
        .await
    }

    async fn record_attempt(&self, id: &JobId, record: &AttemptRecord) -> QueueResult<()> {
        let record = record.clone();
        self.update(id, move |job| {
            job.attempt_history.push(record);
            Ok(())
        })
        .await
    }

    async fn mark_completed(&self, id: &JobId, output_url: &str) -> QueueResult<Transition> {
        self.update(id, |job| {
            if job.is_terminal() {
                return Ok(Transition::AlreadyTerminal);
            }
            job.complete(output_url)?;
            Ok(Transition::Applied)
        })
        .await
    }

    async fn mark_failed(&self, id: &JobId, error: &JobError) -> QueueResult<Transition> {
        let error = error.clone();
        self.update(id, move |job| {
            if job.is_terminal() {
                return Ok(Transition::AlreadyTerminal);
            }
            job.fail(error)?;
            Ok(Transition::Applied)
        })
        .await
    }
}
