mod buffer;
mod cloud_mqtt;
mod config;
mod credentials;
mod frame;
mod http;
mod local_mqtt;
mod router;
mod security;
mod serial;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::buffer::{ForwardBuffer, TokenBucket};
use crate::cloud_mqtt::{CloudEvent, CloudMqttConfig};
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::local_mqtt::{LocalEvent, LocalMqttConfig};
use crate::router::{CloudCommand, CloudLink, DeviceRequest, EventRouter};
use crate::security::{SecurityConfig, SecurityCore};

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,edge_gateway=info".into());
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
    tracing::info!(gateway_id = %config.gateway_id, "edge gateway starting");

    let cancel = CancellationToken::new();

    let credentials = Arc::new(CredentialStore::new(config.data_dir.clone()));
    credentials.load().await.context("loading credential store")?;

    let security = Arc::new(SecurityCore::new(
        config.hmac_key.clone(),
        SecurityConfig {
            ts_tolerance_s: config.ts_tolerance_s,
            nonce_cache_size: config.nonce_cache_size,
            max_failed_attempts: config.max_failed_attempts,
            lockout_duration_s: config.lockout_duration_s,
            rate_limit_window_s: config.rate_limit_window_s,
            rate_limit_max_requests: config.rate_limit_max_requests,
        },
    ));

    let forward_buffer = Arc::new(ForwardBuffer::new(config.buffer_max));

    let (local_tx, mut local_rx) = mpsc::channel::<LocalEvent>(256);
    let (cloud_tx, mut cloud_rx) = mpsc::channel::<CloudEvent>(256);

    let local_cfg = LocalMqttConfig {
        host: config.local_host.clone(),
        port: config.local_port,
        client_id: format!("edge-gateway-{}", config.gateway_id),
        username: config.local_username.clone(),
        password: config.local_password.clone(),
        tls_ca: config
            .local_tls_ca
            .as_ref()
            .and_then(|p| std::fs::read(p).ok()),
    };
    let (local_mqtt, local_handle) = local_mqtt::start(local_cfg, local_tx, cancel.clone());

    let cloud_cfg = CloudMqttConfig {
        host: config.cloud_host.clone(),
        port: config.cloud_port,
        gateway_id: config.gateway_id.clone(),
        ca: std::fs::read(&config.cloud_tls_ca).context("reading cloud CA cert")?,
        client_cert: std::fs::read(&config.cloud_tls_cert).context("reading cloud client cert")?,
        client_key: std::fs::read(&config.cloud_tls_key).context("reading cloud client key")?,
    };
    let (cloud_mqtt, cloud_handle) = cloud_mqtt::start(cloud_cfg, cloud_tx, cancel.clone());

    let flush_buffer = forward_buffer.clone();
    let flush_cloud = cloud_mqtt.clone();
    let flush_cancel = cancel.clone();
    let flush_rate = config.flush_rate_per_sec;
    let flush_handle = tokio::spawn(async move {
        let reconnected = flush_cloud.reconnected();
        let mut bucket = TokenBucket::new(flush_rate, flush_rate.max(1));
        let mut retry_ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = flush_cancel.cancelled() => break,
                _ = reconnected.notified() => {}
                _ = retry_ticker.tick() => {}
            }
            while flush_cloud.is_connected() && !flush_buffer.is_empty() {
                if flush_cancel.is_cancelled() {
                    break;
                }
                if !bucket.try_take(1.0) {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                let Some(msg) = flush_buffer.pop_flushed() else {
                    break;
                };
                if let Err(err) = flush_cloud.publish(msg.topic.clone(), msg.payload.clone()).await {
                    tracing::warn!(error = %err, topic = %msg.topic, "flush publish failed, re-buffering");
                    flush_buffer.enqueue(msg.topic, msg.payload);
                    break;
                }
            }
        }
        tracing::info!("flush loop stopped");
    });

    let frame_stats = Arc::new(AsyncMutex::new(frame::FrameCodecStats::default()));
    let (lora, mut frame_rx, serial_handle) = serial::SerialLink::start(
        config.serial_port.clone(),
        config.serial_baud,
        frame_stats.clone(),
        cancel.clone(),
    );

    let router = Arc::new(EventRouter::new(
        config.gateway_id.clone(),
        security.clone(),
        credentials.clone(),
        forward_buffer.clone(),
        local_mqtt.clone() as Arc<dyn router::LocalPublish>,
        cloud_mqtt.clone() as Arc<dyn router::CloudLink>,
        lora.clone() as Arc<dyn router::LoraSend>,
        config.temp_device_id.clone(),
        config.fan_device_id.clone(),
    ));

    let (sync_trigger_tx, sync_trigger_rx) = mpsc::channel::<()>(4);
    let http_client = reqwest::Client::new();
    let sync_client = Arc::new(sync::SyncClient::new(
        config.gateway_id.clone(),
        config.cloud_api_base_url.clone(),
        Duration::from_secs(config.sync_interval_s),
        credentials.clone(),
        sync::reqwest_like::Client::new(Arc::new(sync::reqwest_like::ReqwestHttp(http_client))),
    ));
    let sync_handle = sync_client.start(sync_trigger_rx, cancel.clone());

    let local_events_router = router.clone();
    let local_events_handle = tokio::spawn(async move {
        while let Some(event) = local_rx.recv().await {
            match event {
                LocalEvent::Telemetry { device_id, data } => {
                    local_events_router.handle_telemetry(&device_id, data).await;
                }
                LocalEvent::Request { device_id, body, hmac } => {
                    local_events_router
                        .handle_request(DeviceRequest { device_id, body, hmac })
                        .await;
                }
                LocalEvent::Status { device_id, status } => {
                    local_events_router.handle_status(&device_id, status).await;
                }
            }
        }
    });

    let cloud_events_router = router.clone();
    let cloud_events_handle = tokio::spawn(async move {
        while let Some(event) = cloud_rx.recv().await {
            match event {
                CloudEvent::Command { command_id, device_id, cmd, params } => {
                    cloud_events_router
                        .handle_cloud_command(CloudCommand { command_id, device_id, cmd, params })
                        .await;
                }
                CloudEvent::SyncTrigger => {
                    let _ = sync_trigger_tx.send(()).await;
                }
            }
        }
    });

    let frame_router = router.clone();
    let frame_handle = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if let frame::FramePayload::RfidUid(uid) = frame.payload {
                let address = frame::device_type_to_nibble(frame.device_type) as u16;
                frame_router.handle_rfid_scan(&uid, address, 23).await;
            }
        }
    });

    let sweep_router = router.clone();
    let sweep_cancel = cancel.clone();
    let sweep_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = sweep_cancel.cancelled() => break,
                _ = ticker.tick() => sweep_router.sweep_expired_commands().await,
            }
        }
    });

    let heartbeat_cloud = cloud_mqtt.clone();
    let heartbeat_gateway_id = config.gateway_id.clone();
    let heartbeat_cancel = cancel.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_s));
        loop {
            tokio::select! {
                _ = heartbeat_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let topic = format!("gateway/{}/status/gateway", heartbeat_gateway_id);
                    let payload = serde_json::json!({ "status": "online" });
                    let _ = heartbeat_cloud.publish(topic, payload).await;
                }
            }
        }
    });

    let http_state = http::HttpState {
        security: security.clone(),
        router: router.clone(),
        frame_stats,
    };
    let app = http::router(http_state);
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, "edge gateway local HTTP listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = local_handle => {}
        _ = cloud_handle => {}
        _ = flush_handle => {}
        _ = serial_handle => {}
        _ = sync_handle => {}
        _ = local_events_handle => {}
        _ = cloud_events_handle => {}
        _ = frame_handle => {}
        _ = sweep_handle => {}
        _ = heartbeat_handle => {}
        _ = http_handle => {}
    }

    cancel.cancel();
    credentials
        .persist()
        .await
        .context("force-persisting credential store on exit")?;

    Ok(())
}
