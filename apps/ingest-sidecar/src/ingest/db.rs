use super::types::DeviceMeta;
use crate::ingest::TelemetryIngestor;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

impl TelemetryIngestor {
    /// Resolves (gateway_id, device_id) to its owning user, caching hits the
    /// way `get_sensor_meta` caches sensor->node lookups.
    pub(in crate::ingest) async fn resolve_device(
        &self,
        gateway_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceMeta>> {
        let cache_key = format!("{gateway_id}/{device_id}");
        {
            let state = self.state.lock().await;
            if let Some(meta) = state.device_meta.get(&cache_key) {
                return Ok(Some(meta.clone()));
            }
        }

        let row = sqlx::query(
            r#"
            SELECT d.device_id, d.gateway_id, g.user_id
            FROM devices d
            JOIN gateways g ON g.gateway_id = d.gateway_id
            WHERE d.device_id = $1 AND d.gateway_id = $2
            "#,
        )
        .bind(device_id)
        .bind(gateway_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            tracing::warn!(gateway_id, device_id, "unknown device in ingest stream");
            return Ok(None);
        };

        let meta = DeviceMeta {
            device_id: row.try_get("device_id")?,
            gateway_id: row.try_get("gateway_id")?,
            user_id: row.try_get("user_id")?,
        };

        let mut state = self.state.lock().await;
        state.device_meta.insert(cache_key, meta.clone());
        Ok(Some(meta))
    }

    pub(in crate::ingest) async fn insert_access_log(
        &self,
        time: DateTime<Utc>,
        device_id: &str,
        gateway_id: &str,
        user_id: Uuid,
        method: &str,
        result: &str,
        password_id: Option<Uuid>,
        rfid_uid: Option<&str>,
        deny_reason: Option<&str>,
        metadata: &Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO access_logs
                (time, device_id, gateway_id, user_id, method, result, password_id, rfid_uid, deny_reason, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(time)
        .bind(device_id)
        .bind(gateway_id)
        .bind(user_id)
        .bind(method)
        .bind(result)
        .bind(password_id)
        .bind(rfid_uid)
        .bind(deny_reason)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        if result == "granted" {
            match method {
                "passkey" => {
                    if let Some(password_id) = password_id {
                        self.touch_password_last_used(password_id, time).await?;
                    }
                }
                "rfid" => {
                    if let Some(uid) = rfid_uid {
                        self.touch_rfid_last_used(uid, time).await?;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn touch_password_last_used(&self, password_id: Uuid, time: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE password_credentials SET last_used = $2 WHERE password_id = $1 AND (last_used IS NULL OR $2 > last_used)",
        )
        .bind(password_id)
        .bind(time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_rfid_last_used(&self, uid: &str, time: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE rfid_cards SET last_used = $2 WHERE uid = $1 AND (last_used IS NULL OR $2 > last_used)",
        )
        .bind(uid)
        .bind(time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(in crate::ingest) async fn insert_system_log(
        &self,
        time: DateTime<Utc>,
        gateway_id: &str,
        device_id: Option<&str>,
        user_id: Option<Uuid>,
        log_type: &str,
        event: &str,
        severity: &str,
        message: &str,
        value: Option<f64>,
        threshold: Option<f64>,
        metadata: &Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO system_logs
                (time, gateway_id, device_id, user_id, log_type, event, severity, message, value, threshold, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
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
        .bind(value)
        .bind(threshold)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `last_seen` only advances forward; a stray out-of-order message never
    /// rewinds liveness state. Status is only written when `status` is set,
    /// mirroring `update_node_last_seen_db`'s conditional-update shape.
    pub(in crate::ingest) async fn update_device_seen(
        &self,
        gateway_id: &str,
        device_id: &str,
        time: DateTime<Utc>,
        status: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE devices
            SET last_seen = CASE WHEN last_seen IS NULL OR $3 > last_seen THEN $3 ELSE last_seen END,
                status = COALESCE($4, status)
            WHERE device_id = $1 AND gateway_id = $2
            "#,
        )
        .bind(device_id)
        .bind(gateway_id)
        .bind(time)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(in crate::ingest) async fn update_gateway_seen(
        &self,
        gateway_id: &str,
        time: DateTime<Utc>,
        status: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE gateways
            SET last_seen = CASE WHEN last_seen IS NULL OR $2 > last_seen THEN $2 ELSE last_seen END,
                status = COALESCE($3, status)
            WHERE gateway_id = $1
            "#,
        )
        .bind(gateway_id)
        .bind(time)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bridges an ingest-side event to cloud-api's C10 broadcast pump via
    /// Postgres NOTIFY, since the two binaries share only the database.
    pub(in crate::ingest) async fn notify_realtime(&self, payload: &Value) {
        let text = payload.to_string();
        if let Err(err) = sqlx::query("SELECT pg_notify('realtime_events', $1)")
            .bind(text)
            .execute(&self.pool)
            .await
        {
            tracing::debug!(error = %err, "realtime notify failed");
        }
    }
}
