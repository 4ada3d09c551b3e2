//! Video render worker binary.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vrender_media::{HttpAssetFetcher, ProcessSupervisor, TimelineCompiler};
use vrender_queue::{JobQueue, RedisJobStore};
use vrender_storage::S3Store;
use vrender_worker::{metrics, JobExecutor, RenderOrchestrator, WebhookNotifier, WorkerConfig};

#[tokio::main]
async fn main() {
    // A provider may already be installed; that's fine
    let _ = rustls::crypto::ring::default_provider().install_default();

    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting vrender-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        match metrics::install_exporter(port) {
            Ok(()) => info!("Serving metrics on :{}", port),
            Err(e) => warn!("Failed to install metrics exporter: {}", e),
        }
    }

    let executor = match build_executor(config) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!("Failed to create job executor: {}", e);
            std::process::exit(1);
        }
    };

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_executor.shutdown();
        }
    });

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

fn build_executor(config: WorkerConfig) -> Result<JobExecutor, Box<dyn std::error::Error>> {
    let fetcher = HttpAssetFetcher::new(config.asset_fetch_timeout)?;
    let compiler = TimelineCompiler::new(&config.work_dir, Arc::new(fetcher))
        .with_ffmpeg_program(config.ffmpeg_path.clone());

    let store = S3Store::from_env()?;
    let signed_url_ttl = store.signed_url_ttl();
    let jobs = RedisJobStore::from_env()?;
    let notifier = WebhookNotifier::new(config.webhook_timeout)?;
    let queue = JobQueue::from_env()?;

    let orchestrator = RenderOrchestrator::new(
        compiler,
        Arc::new(ProcessSupervisor::new()),
        Arc::new(store),
        Arc::new(jobs),
        Arc::new(notifier),
    )
    .with_job_timeout(config.job_timeout)
    .with_signed_url_ttl(signed_url_ttl)
    .with_max_attempts(queue.max_retries());

    Ok(JobExecutor::new(config, queue, Arc::new(orchestrator)))
}
