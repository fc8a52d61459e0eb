//! Command path (C11): issues a command against a gateway's device and
//! sweeps unacknowledged commands into `expired`. Issuance is an internal
//! service function rather than a public HTTP endpoint — REST-caller
//! authentication for arbitrary command issuance is out of scope; this is
//! the boundary the excluded REST API is expected to call into.

use crate::services::mqtt::MqttPublisher;
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("device {device_id} is not known on gateway {gateway_id}")]
    UnknownDevice { gateway_id: String, device_id: String },
    #[error("device {device_id} is offline")]
    DeviceOffline { device_id: String },
}

pub async fn issue_command(
    pool: &PgPool,
    mqtt: &MqttPublisher,
    topic_prefix: &str,
    gateway_id: &str,
    device_id: &str,
    user_id: Uuid,
    command_type: &str,
    params: Value,
) -> Result<Uuid> {
    let status: Option<(String,)> = sqlx::query_as(
        "SELECT status FROM devices WHERE device_id = $1 AND gateway_id = $2",
    )
    .bind(device_id)
    .bind(gateway_id)
    .fetch_optional(pool)
    .await
    .context("looking up target device")?;

    let Some((status,)) = status else {
        return Err(CommandError::UnknownDevice {
            gateway_id: gateway_id.to_string(),
            device_id: device_id.to_string(),
        }
        .into());
    };
    if status != "online" {
        return Err(CommandError::DeviceOffline {
            device_id: device_id.to_string(),
        }
        .into());
    }

    let command_id = Uuid::new_v4();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO command_logs
            (time, command_id, source, device_id, gateway_id, user_id, command_type, status, params)
        VALUES ($1, $2, 'cloud-api', $3, $4, $5, $6, 'sent', $7)
        "#,
    )
    .bind(now)
    .bind(command_id)
    .bind(device_id)
    .bind(gateway_id)
    .bind(user_id)
    .bind(command_type)
    .bind(&params)
    .execute(pool)
    .await
    .context("inserting command log")?;

    let topic = format!("{topic_prefix}/{gateway_id}/command/{device_id}");
    let payload = json!({
        "command_id": command_id,
        "cmd": command_type,
        "params": params,
        "timestamp": now,
        "user_id": user_id,
    });
    mqtt.publish_json(&topic, &payload)
        .await
        .context("publishing command")?;

    Ok(command_id)
}

/// Marks `sent` commands older than the expiry window as `expired`. The
/// gateway's own C7 sweeper does the same on its side; this is the cloud
/// ledger's half of step 7 in the command path.
pub fn start_expiry_sweeper(
    pool: PgPool,
    expiry_s: i64,
    sweep_interval_s: u64,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(sweep_interval_s));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = sweep_expired(&pool, expiry_s).await {
                        tracing::warn!(error = %err, "command expiry sweep failed");
                    }
                }
            }
        }
    })
}

async fn sweep_expired(pool: &PgPool, expiry_s: i64) -> Result<()> {
    let cutoff = Utc::now() - chrono::Duration::seconds(expiry_s);
    sqlx::query(
        r#"
        UPDATE command_logs
        SET status = 'expired'
        WHERE status = 'sent' AND time < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("expiring stale commands")?;
    Ok(())
}
