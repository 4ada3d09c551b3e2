//! Worker configuration.

use std::time::Duration;

use tracing::warn;
use vrender_models::encoding::{
    ASSET_FETCH_TIMEOUT_MS, DEFAULT_WORK_DIR, JOB_TIMEOUT_MS, MAX_CLIPS, WEBHOOK_TIMEOUT_MS,
};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Hard wall-clock limit for one encoder run
    pub job_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Root of per-job workspaces
    pub work_dir: String,
    /// How often the worker should scan for orphaned pending jobs
    pub claim_interval: Duration,
    /// Minimum idle time before a pending job can be claimed (crash recovery).
    /// Running attempts refresh their lease well inside this window, and it
    /// should also exceed the longest possible attempt.
    pub claim_min_idle: Duration,
    /// How often due retries are moved back onto the stream
    pub promote_interval: Duration,
    /// Timeout for a single webhook delivery
    pub webhook_timeout: Duration,
    /// Timeout for fetching a single clip image
    pub asset_fetch_timeout: Duration,
    /// FFmpeg binary
    pub ffmpeg_path: String,
    /// Serve Prometheus metrics on this port when set
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            job_timeout: Duration::from_millis(JOB_TIMEOUT_MS),
            shutdown_timeout: Duration::from_secs(30),
            work_dir: DEFAULT_WORK_DIR.to_string(),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(900), // 15 minutes
            promote_interval: Duration::from_millis(250),
            webhook_timeout: Duration::from_millis(WEBHOOK_TIMEOUT_MS),
            asset_fetch_timeout: Duration::from_millis(ASSET_FETCH_TIMEOUT_MS),
            ffmpeg_path: "ffmpeg".to_string(),
            metrics_port: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            max_concurrent_jobs: env_parse::<usize>("WORKER_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_jobs),
            job_timeout: env_parse("WORKER_JOB_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.job_timeout),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            work_dir: std::env::var("WORKER_WORK_DIR").unwrap_or(defaults.work_dir),
            claim_interval: env_parse("WORKER_CLAIM_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_interval),
            claim_min_idle: env_parse("WORKER_CLAIM_MIN_IDLE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_min_idle),
            promote_interval: env_parse("WORKER_PROMOTE_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.promote_interval),
            webhook_timeout: env_parse("WEBHOOK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.webhook_timeout),
            asset_fetch_timeout: env_parse("ASSET_FETCH_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.asset_fetch_timeout),
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
            metrics_port: env_parse("METRICS_PORT"),
        };

        let worst_case = config.worst_case_attempt();
        if config.claim_min_idle <= worst_case {
            warn!(
                "WORKER_CLAIM_MIN_IDLE_SECS ({}s) does not exceed the longest possible attempt ({}s); \
                 relying on lease refresh alone",
                config.claim_min_idle.as_secs(),
                worst_case.as_secs()
            );
        }

        config
    }

    /// Upper bound on one attempt: every clip fetch timing out, then the
    /// encoder timing out, then one webhook timing out.
    pub fn worst_case_attempt(&self) -> Duration {
        self.asset_fetch_timeout * MAX_CLIPS as u32 + self.job_timeout + self.webhook_timeout
    }

    /// How often a running attempt re-claims its delivery.
    pub fn lease_refresh_interval(&self) -> Duration {
        (self.claim_min_idle / 4).max(Duration::from_secs(1))
    }
}
