mod config;
mod http;
mod ingest;
mod liveness;
mod mqtt;
mod pipeline;

use anyhow::{Context, Result};
use config::Config;
use ingest::TelemetryIngestor;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ingest_sidecar=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;
    tracing::info!("ingest sidecar starting");

    let cancel = CancellationToken::new();

    let pool = pipeline::build_pool(&config.database_url, config.db_pool_size)
        .await
        .context("connecting to database")?;

    let stats = Arc::new(pipeline::IngestStats::new());
    let (batch_tx, batch_rx) = mpsc::channel::<pipeline::BatchCommand>(config.max_queue);
    let pipeline_handle = pipeline::PipelineHandle::new(batch_tx, stats.clone());
    let mut worker_handle = pipeline::spawn_worker(
        pool.clone(),
        batch_rx,
        stats.clone(),
        config.batch_size,
        config.flush_interval(),
    );

    let ingestor = TelemetryIngestor::new(pool.clone(), pipeline_handle, config.timestamp_drift_s);

    let mqtt_config = config.clone();
    let mqtt_ingestor = ingestor.clone();
    let mut mqtt_handle = tokio::spawn(async move {
        if let Err(err) = mqtt::run_listener(mqtt_config, mqtt_ingestor).await {
            tracing::error!(error = %err, "ingest listener exited");
        }
    });

    let mut liveness_handle = liveness::start(config.clone(), pool.clone(), cancel.clone());

    let http_state = http::HttpState { stats: stats.clone() };
    let app = http::router(http_state);
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, "ingest sidecar local HTTP listening");
    let mut http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = &mut mqtt_handle => {}
        _ = &mut liveness_handle => {}
        _ = &mut http_handle => {}
    }

    cancel.cancel();
    mqtt_handle.abort();
    liveness_handle.abort();
    http_handle.abort();

    ingestor.flush_pending().await.ok();
    drop(ingestor);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), worker_handle).await;
    pool.close().await;

    Ok(())
}
