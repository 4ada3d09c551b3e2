use std::path::Path;

use vrender_media::ffmpeg_version;
use vrender_queue::JobQueue;
use vrender_storage::S3Store;
use vrender_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();

    println!("worker-selfcheck: starting with work_dir={}", config.work_dir);
    ensure_workdir(&config.work_dir).await?;
    ensure_ffmpeg(&config.ffmpeg_path).await?;
    ensure_queue().await?;
    ensure_storage().await?;

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_workdir<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path).await?;
    let marker = path.join(".selfcheck");
    tokio::fs::write(&marker, b"ok").await?;
    tokio::fs::remove_file(&marker).await?;
    Ok(())
}

async fn ensure_ffmpeg(program: &str) -> anyhow::Result<()> {
    let version = ffmpeg_version(program)
        .await
        .map_err(|e| anyhow::anyhow!("ffmpeg not available: {}", e))?;
    println!("worker-selfcheck: {}", version);
    Ok(())
}

async fn ensure_queue() -> anyhow::Result<()> {
    let queue = JobQueue::from_env()?;
    queue
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("redis not reachable: {}", e))?;
    println!("worker-selfcheck: redis ok");
    Ok(())
}

async fn ensure_storage() -> anyhow::Result<()> {
    let store = S3Store::from_env()?;
    store
        .check_connectivity()
        .await
        .map_err(|e| anyhow::anyhow!("object storage not reachable: {}", e))?;
    println!("worker-selfcheck: storage ok");
    Ok(())
}
