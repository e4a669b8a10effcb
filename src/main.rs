use std::sync::Arc;
use anyhow::Context;
use courier::config::Config;
use courier::{CaptureMetadata, HttpUploader, LocalStore, TaskUpdate, UploadQueue};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("courier=info")),
        )
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "courier.toml".to_string());
    let config = Config::load_config(&config_path)?;

    let uploader = HttpUploader::new(&config.endpoint, config.uploader_config())?;
    let mut builder = UploadQueue::builder()
        .config(config.queue.clone())
        .uploader(Arc::new(uploader));

    match LocalStore::open(&config.store_dir).await {
        Ok(store) => builder = builder.store(Arc::new(store)),
        Err(err) => warn!(%err, "continuing without crash recovery"),
    }

    let handle = builder.build()?;
    let queue = handle.queue.clone();

    let payload = tokio::fs::read(&config.file_path)
        .await
        .with_context(|| format!("reading {}", config.file_path.display()))?;

    let mut metadata = CaptureMetadata::new(&config.record_id, &config.actor_id);
    if let Some(sub_record_id) = &config.sub_record_id {
        metadata = metadata.with_sub_record(sub_record_id);
    }

    let task_id = queue.enqueue(payload, config.destination_name(), metadata).await?;
    let mut watch = queue
        .watch(task_id)
        .await?
        .context("task vanished right after enqueue")?;

    let mut succeeded = false;
    while let Some(update) = watch.next().await {
        match update {
            TaskUpdate::Progress(percent) => info!(%task_id, percent, "uploading"),
            TaskUpdate::Finished(outcome) => {
                succeeded = outcome.is_success();
                info!(%task_id, ?outcome, "finished");
            }
        }
    }

    info!(
        pending = queue.pending_count().await?,
        failed = queue.failed_count().await?,
        "queue state"
    );

    handle.shutdown().await?;

    anyhow::ensure!(succeeded, "upload {} did not complete", task_id);
    Ok(())
}
