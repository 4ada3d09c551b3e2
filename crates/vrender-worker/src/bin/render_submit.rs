//! Submit a render request, or look up a job's status.
//!
//! ```text
//! render-submit <request.json>
//! render-submit --status <job-id>
//! ```

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use url::Url;

use vrender_models::{Job, JobId, Timeline};
use vrender_queue::{JobQueue, JobRepository, RedisJobStore, RenderJob};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderRequest {
    timeline: Timeline,
    #[serde(default)]
    callback_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [flag, id] if flag == "--status" => status(JobId::from_string(id.as_str())).await,
        [path] => submit(path).await,
        _ => bail!("usage: render-submit <request.json> | render-submit --status <job-id>"),
    }
}

async fn submit(path: &str) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path))?;
    let request: RenderRequest = serde_json::from_str(&raw).context("parsing render request")?;

    request
        .timeline
        .validate()
        .map_err(|e| anyhow!("{}: {}", e.code(), e))?;
    if let Some(callback) = &request.callback_url {
        check_callback_url(callback)?;
    }

    let job = Job::new(request.timeline, request.callback_url);
    let jobs = RedisJobStore::from_env()?;
    jobs.create(&job).await?;

    let queue = JobQueue::from_env()?;
    queue.init().await?;
    queue.enqueue(&RenderJob::from_job(&job)).await?;

    println!("{}", serde_json::to_string_pretty(&job.status_view())?);
    Ok(())
}

async fn status(id: JobId) -> anyhow::Result<()> {
    let jobs = RedisJobStore::from_env()?;
    let job = jobs
        .get(&id)
        .await?
        .ok_or_else(|| anyhow!("job {} not found", id))?;

    println!("{}", serde_json::to_string_pretty(&job.status_view())?);
    Ok(())
}

fn check_callback_url(raw: &str) -> anyhow::Result<()> {
    let url = Url::parse(raw).with_context(|| format!("invalid callbackUrl {}", raw))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("callbackUrl must be http or https, got {}", url.scheme());
    }
    Ok(())
}
