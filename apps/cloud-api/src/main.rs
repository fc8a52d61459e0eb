use anyhow::{Context, Result};
use clap::Parser;
use cloud_api::{cli, command, config::Config, db, realtime, routes, services, state::AppState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let config = Config::from_env()?;
    init_tracing()?;
    tracing::info!("cloud-api starting");

    let pool = db::connect_lazy(&config.database_url)?;

    let (mqtt, _mqtt_task) = services::mqtt::MqttPublisher::new(
        &config.mqtt_client_id,
        &config.mqtt_host,
        config.mqtt_port,
        config.mqtt_username.as_deref(),
        config.mqtt_password.as_deref(),
    )?;

    let broadcaster = Arc::new(realtime::Broadcaster::new());
    let cancel = CancellationToken::new();

    let mut listener_handle =
        realtime::start_pg_listener(pool.clone(), broadcaster.clone(), cancel.clone());
    let mut sweeper_handle = command::start_expiry_sweeper(
        pool.clone(),
        config.command_expiry_s,
        config.command_sweep_interval_s,
        cancel.clone(),
    );

    let state = AppState {
        config: config.clone(),
        db: pool.clone(),
        mqtt: Arc::new(mqtt),
        broadcaster,
    };

    let host = args.host.unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind cloud-api listener on {addr}"))?;
    tracing::info!(%addr, "cloud-api listening");

    let app = routes::router(state);
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = &mut listener_handle => {}
        _ = &mut sweeper_handle => {}
        _ = &mut server_handle => {}
    }

    cancel.cancel();
    listener_handle.abort();
    sweeper_handle.abort();
    server_handle.abort();
    pool.close().await;

    Ok(())
}
