//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use vrender_models::ErrorCode;

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_COMPLETED_TOTAL: &str = "vrender_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vrender_jobs_failed_total";
    pub const JOB_RETRIES_TOTAL: &str = "vrender_job_retries_total";
    pub const FFMPEG_DURATION_MS: &str = "vrender_ffmpeg_duration_ms";
    pub const WEBHOOK_FAILURES_TOTAL: &str = "vrender_webhook_failures_total";
}

/// Install the Prometheus recorder and serve `/metrics` on `port`.
/// Must be called from within the Tokio runtime.
pub fn install_exporter(port: u16) -> Result<(), BuildError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()
}

pub fn record_job_completed() {
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
}

pub fn record_job_failed(code: ErrorCode) {
    counter!(names::JOBS_FAILED_TOTAL, "code" => code.as_str()).increment(1);
}

pub fn record_job_retry(code: ErrorCode) {
    counter!(names::JOB_RETRIES_TOTAL, "code" => code.as_str()).increment(1);
}

pub fn record_ffmpeg_duration(duration_ms: u64, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    histogram!(names::FFMPEG_DURATION_MS, "outcome" => outcome).record(duration_ms as f64);
}

pub fn record_webhook_failure() {
    counter!(names::WEBHOOK_FAILURES_TOTAL).increment(1);
}
