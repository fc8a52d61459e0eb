mod db;
mod state;
pub(crate) mod types;

#[cfg(test)]
mod tests;

use crate::pipeline::PipelineHandle;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use types::TelemetryRow;
use uuid::Uuid;

const STATUS_ONLINE: &str = "online";
const STATUS_OFFLINE: &str = "offline";

/// Normalizes heterogeneous gateway/device payloads into the relational
/// time-series schema. Mirrors the shape of `TelemetryIngestor` in the
/// farm-telemetry sidecar this binary is descended from: a cheap in-memory
/// cache over `self.state` backstopping a pooled connection, with the pool
/// itself owned by the process (shared with the liveness sweeper).
#[derive(Clone)]
pub struct TelemetryIngestor {
    pool: PgPool,
    pipeline: PipelineHandle,
    state: Arc<Mutex<state::IngestState>>,
    timestamp_drift: ChronoDuration,
}

impl TelemetryIngestor {
    pub fn new(pool: PgPool, pipeline: PipelineHandle, timestamp_drift_s: i64) -> Self {
        Self {
            pool,
            pipeline,
            state: Arc::new(Mutex::new(state::IngestState::new())),
            timestamp_drift: ChronoDuration::seconds(timestamp_drift_s),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn flush_pending(&self) -> anyhow::Result<()> {
        self.pipeline.flush().await
    }

    /// Substitutes server time when the device-reported timestamp drifts
    /// more than `timestamp_drift` from wall clock, logging the correction.
    pub fn normalize_timestamp(&self, device_ts: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let now = Utc::now();
        match device_ts {
            Some(ts) => {
                let drift = (now - ts).abs();
                if drift > self.timestamp_drift {
                    tracing::debug!(%ts, %now, "device timestamp drift exceeds tolerance, substituting server time");
                    now
                } else {
                    ts
                }
            }
            None => now,
        }
    }

    pub async fn ingest_telemetry(
        &self,
        gateway_id: &str,
        device_id: &str,
        time: DateTime<Utc>,
        temperature: Option<f64>,
        humidity: Option<f64>,
        metadata: Value,
    ) -> anyhow::Result<()> {
        let Some(meta) = self.resolve_device(gateway_id, device_id).await? else {
            return Ok(());
        };

        self.pipeline
            .enqueue(TelemetryRow {
                time,
                device_id: meta.device_id.clone(),
                gateway_id: meta.gateway_id.clone(),
                user_id: meta.user_id,
                temperature,
                humidity,
                metadata,
            })
            .await?;

        self.update_device_seen(gateway_id, device_id, time, Some(STATUS_ONLINE))
            .await?;
        self.notify_realtime(&json!({
            "type": "telemetry",
            "user_id": meta.user_id,
            "gateway_id": meta.gateway_id,
            "device_id": meta.device_id,
            "temperature": temperature,
            "humidity": humidity,
        }))
        .await;
        Ok(())
    }

    pub async fn ingest_access(
        &self,
        gateway_id: &str,
        device_id: &str,
        time: DateTime<Utc>,
        method: &str,
        result: &str,
        password_id: Option<Uuid>,
        rfid_uid: Option<&str>,
        deny_reason: Option<&str>,
        metadata: Value,
    ) -> anyhow::Result<()> {
        let Some(meta) = self.resolve_device(gateway_id, device_id).await? else {
            return Ok(());
        };

        self.insert_access_log(
            time,
            &meta.device_id,
            &meta.gateway_id,
            meta.user_id,
            method,
            result,
            password_id,
            rfid_uid,
            deny_reason,
            &metadata,
        )
        .await?;

        self.update_device_seen(gateway_id, device_id, time, Some(STATUS_ONLINE))
            .await?;
        self.notify_realtime(&json!({
            "type": "access_event",
            "user_id": meta.user_id,
            "gateway_id": meta.gateway_id,
            "device_id": meta.device_id,
            "method": method,
            "result": result,
        }))
        .await;
        Ok(())
    }

    /// Normalizes a vendor device-status word into `online`/`offline`,
    /// appends a `device_status_change` system log and updates the row.
    /// Unknown states are treated as online (permissive, per design notes).
    pub async fn ingest_device_status(
        &self,
        gateway_id: &str,
        device_id: &str,
        time: DateTime<Utc>,
        raw_status: &str,
        command_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let Some(meta) = self.resolve_device(gateway_id, device_id).await? else {
            return Ok(());
        };

        let normalized = normalize_device_status(raw_status);

        self.update_device_seen(gateway_id, device_id, time, Some(normalized))
            .await?;

        self.insert_system_log(
            time,
            &meta.gateway_id,
            Some(&meta.device_id),
            Some(meta.user_id),
            "device_status_change",
            "device_status_change",
            "info",
            &format!("device {} reported status {}", meta.device_id, raw_status),
            None,
            None,
            &json!({ "raw_status": raw_status, "normalized": normalized }),
        )
        .await?;

        if let Some(command_id) = command_id {
            self.record_command_response(command_id, &meta.device_id, &meta.gateway_id, time)
                .await?;
        }

        self.notify_realtime(&json!({
            "type": "device_status",
            "user_id": meta.user_id,
            "gateway_id": meta.gateway_id,
            "device_id": meta.device_id,
            "status": normalized,
        }))
        .await;

        Ok(())
    }

    pub async fn ingest_gateway_status(
        &self,
        gateway_id: &str,
        time: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.update_gateway_seen(gateway_id, time, Some(STATUS_ONLINE)).await
    }

    async fn record_command_response(
        &self,
        command_id: &str,
        device_id: &str,
        gateway_id: &str,
        time: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Ok(command_id) = Uuid::parse_str(command_id) else {
            return Ok(());
        };
        sqlx::query(
            r#"
            UPDATE command_logs
            SET status = 'completed', completed_at = $2
            WHERE command_id = $1 AND device_id = $3 AND gateway_id = $4 AND status != 'expired'
            "#,
        )
        .bind(command_id)
        .bind(time)
        .bind(device_id)
        .bind(gateway_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn normalize_device_status(raw: &str) -> &'static str {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "online" | "locked" | "unlocked" | "opened" | "closed" | "active" | "ready"
        | "alive" => STATUS_ONLINE,
        "off" | "offline" | "error" | "disconnected" => STATUS_OFFLINE,
        other => {
            tracing::debug!(raw = other, "unknown device status word, treating as online");
            STATUS_ONLINE
        }
    }
}
