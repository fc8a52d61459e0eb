//! Liveness detector (C9): periodic offline sweeper with gateway-before-
//! device cascade. Each tick computes an effective last-seen timestamp,
//! compares it against a derived threshold, and offlines anything that's
//! fallen behind, reading `last_seen` straight from the DB rows the MQTT
//! listener already keeps current rather than a shadow in-memory map.

use crate::config::Config;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::{PgPool, Row};
use std::time::Duration;

pub fn start(config: Config, pool: PgPool, cancel: tokio_util::sync::CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.offline_check_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = sweep(&pool, config.gateway_timeout(), config.device_timeout()).await {
                        tracing::warn!(error = %err, "liveness sweep failed");
                    }
                }
            }
        }
    })
}

/// One tick of the offline-detection sweep: gateway sweep + cascade, then
/// the standalone device sweep, in that order so cascaded devices are never
/// double-logged by the device pass.
pub async fn sweep(pool: &PgPool, gateway_timeout: ChronoDuration, device_timeout: ChronoDuration) -> Result<()> {
    let now = Utc::now();
    let offlined_gateways = sweep_offline_gateways(pool, now, gateway_timeout).await?;
    if !offlined_gateways.is_empty() {
        cascade_gateway_offline(pool, now, &offlined_gateways).await?;
    }
    sweep_offline_devices(pool, now, device_timeout).await?;
    Ok(())
}

async fn sweep_offline_gateways(pool: &PgPool, now: DateTime<Utc>, timeout: ChronoDuration) -> Result<Vec<String>> {
    let cutoff = now - timeout;
    let rows = sqlx::query(
        r#"
        UPDATE gateways
        SET status = 'offline'
        WHERE status = 'online' AND (last_seen IS NULL OR last_seen < $1)
        RETURNING gateway_id
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let mut gateway_ids = Vec::with_capacity(rows.len());
    for row in rows {
        let gateway_id: String = row.try_get("gateway_id")?;
        insert_system_log(
            pool,
            now,
            &gateway_id,
            None,
            None,
            "gateway_offline",
            "gateway_offline",
            "warning",
            &format!("gateway {gateway_id} timed out"),
            json!({}),
        )
        .await?;
        notify_realtime(pool, &json!({ "type": "device_status", "gateway_id": gateway_id, "status": "offline" })).await;
        gateway_ids.push(gateway_id);
    }
    Ok(gateway_ids)
}

async fn cascade_gateway_offline(pool: &PgPool, now: DateTime<Utc>, gateway_ids: &[String]) -> Result<()> {
    let rows = sqlx::query(
        r#"
        UPDATE devices
        SET status = 'offline'
        WHERE gateway_id = ANY($1) AND status != 'offline'
        RETURNING device_id, gateway_id
        "#,
    )
    .bind(gateway_ids)
    .fetch_all(pool)
    .await?;

    for row in rows {
        let device_id: String = row.try_get("device_id")?;
        let gateway_id: String = row.try_get("gateway_id")?;
        insert_system_log(
            pool,
            now,
            &gateway_id,
            Some(&device_id),
            None,
            "device_offline",
            "device_offline",
            "warning",
            &format!("device {device_id} forced offline by gateway cascade"),
            json!({ "reason": "gateway_offline" }),
        )
        .await?;
        notify_realtime(
            pool,
            &json!({ "type": "device_status", "gateway_id": gateway_id, "device_id": device_id, "status": "offline" }),
        )
        .await;
    }
    Ok(())
}

async fn sweep_offline_devices(pool: &PgPool, now: DateTime<Utc>, timeout: ChronoDuration) -> Result<()> {
    let cutoff = now - timeout;
    let rows = sqlx::query(
        r#"
        UPDATE devices
        SET status = 'offline'
        WHERE status = 'online' AND (last_seen IS NULL OR last_seen < $1)
        RETURNING device_id, gateway_id
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    for row in rows {
        let device_id: String = row.try_get("device_id")?;
        let gateway_id: String = row.try_get("gateway_id")?;
        insert_system_log(
            pool,
            now,
            &gateway_id,
            Some(&device_id),
            None,
            "device_offline",
            "device_offline",
            "warning",
            &format!("device {device_id} timed out"),
            json!({ "reason": "timeout" }),
        )
        .await?;
        notify_realtime(
            pool,
            &json!({ "type": "device_status", "gateway_id": gateway_id, "device_id": device_id, "status": "offline" }),
        )
        .await;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_system_log(
    pool: &PgPool,
    time: DateTime<Utc>,
    gateway_id: &str,
    device_id: Option<&str>,
    user_id: Option<uuid::Uuid>,
    log_type: &str,
    event: &str,
    severity: &str,
    message: &str,
    metadata: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO system_logs (time, gateway_id, device_id, user_id, log_type, event, severity, message, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(time)
    .bind(gateway_id)
    .bind(device_id)
    .bind(user_id)
    .bind(log_type)
    .bind(event)
    .bind(severity)
    .bind(message)
    .bind(metadata)
    .execute(pool)
    .await?;
    Ok(())
}

/// Best-effort Postgres NOTIFY bridging liveness/ingest events to the
/// `cloud-api` process's C10 broadcast pump (a `PgListener` on the same
/// channel), since the two binaries don't share in-process state.
async fn notify_realtime(pool: &PgPool, payload: &serde_json::Value) {
    let text = payload.to_string();
    if let Err(err) = sqlx::query("SELECT pg_notify('realtime_events', $1)")
        .bind(text)
        .execute(pool)
        .await
    {
        tracing::debug!(error = %err, "realtime notify failed");
    }
}
