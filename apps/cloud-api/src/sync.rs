//! Sync client REST surface (C4/§6): the gateway polls
//! `GET /api/sync/database/{gateway_id}` with its current `database_version`
//! and applies the returned snapshot when it differs, plus a fallback
//! heartbeat endpoint for when the MQTT retained status message can't get
//! through.

use crate::error::{AppError, AppResult};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::state::AppState;

const DB_VERSION_HEADER: &str = "x-db-version";

#[derive(Debug, Serialize)]
struct PasswordRecord {
    password_id: Uuid,
    hash: String,
    active: bool,
    expires_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct RfidRecord {
    uid: String,
    active: bool,
    card_type: Option<String>,
    expires_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct DeviceRecord {
    device_id: String,
    device_type: String,
    location: Option<String>,
    status: String,
    last_seen: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct DatabaseSnapshot {
    passwords: Vec<PasswordRecord>,
    rfid_cards: Vec<RfidRecord>,
    devices: Vec<DeviceRecord>,
}

async fn gateway_owner(pool: &PgPool, gateway_id: &str) -> AppResult<Uuid> {
    let row: Option<(Uuid,)> = sqlx::query_as("SELECT user_id FROM gateways WHERE gateway_id = $1")
        .bind(gateway_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from_db)?;
    row.map(|(user_id,)| user_id)
        .ok_or_else(|| AppError::new(axum::http::StatusCode::NOT_FOUND, "unknown gateway"))
}

async fn load_snapshot(pool: &PgPool, user_id: Uuid) -> AppResult<DatabaseSnapshot> {
    let passwords: Vec<PasswordRecord> = sqlx::query_as::<_, PasswordRecordRow>(
        r#"SELECT password_id, hash, active, expires_at FROM password_credentials
           WHERE user_id = $1 ORDER BY password_id"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(AppError::from_db)?
    .into_iter()
    .map(Into::into)
    .collect();

    let rfid_cards: Vec<RfidRecord> = sqlx::query_as::<_, RfidRecordRow>(
        r#"SELECT uid, active, card_type, expires_at FROM rfid_cards
           WHERE user_id = $1 ORDER BY uid"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(AppError::from_db)?
    .into_iter()
    .map(Into::into)
    .collect();

    let devices: Vec<DeviceRecord> = sqlx::query_as::<_, DeviceRecordRow>(
        r#"SELECT d.device_id, d.device_type, d.location, d.status, d.last_seen FROM devices d
           JOIN gateways g ON g.gateway_id = d.gateway_id
           WHERE g.user_id = $1 ORDER BY d.device_id"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(AppError::from_db)?
    .into_iter()
    .map(Into::into)
    .collect();

    Ok(DatabaseSnapshot {
        passwords,
        rfid_cards,
        devices,
    })
}

#[derive(sqlx::FromRow)]
struct PasswordRecordRow {
    password_id: Uuid,
    hash: String,
    active: bool,
    expires_at: Option<chrono::DateTime<Utc>>,
}

impl From<PasswordRecordRow> for PasswordRecord {
    fn from(row: PasswordRecordRow) -> Self {
        Self {
            password_id: row.password_id,
            hash: row.hash,
            active: row.active,
            expires_at: row.expires_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RfidRecordRow {
    uid: String,
    active: bool,
    card_type: Option<String>,
    expires_at: Option<chrono::DateTime<Utc>>,
}

impl From<RfidRecordRow> for RfidRecord {
    fn from(row: RfidRecordRow) -> Self {
        Self {
            uid: row.uid,
            active: row.active,
            card_type: row.card_type,
            expires_at: row.expires_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRecordRow {
    device_id: String,
    device_type: String,
    location: Option<String>,
    status: String,
    last_seen: Option<chrono::DateTime<Utc>>,
}

impl From<DeviceRecordRow> for DeviceRecord {
    fn from(row: DeviceRecordRow) -> Self {
        Self {
            device_id: row.device_id,
            device_type: row.device_type,
            location: row.location,
            status: row.status,
            last_seen: row.last_seen,
        }
    }
}

/// 16 hex chars = first 16 hex digits of SHA-256 over the snapshot
/// serialized with sorted object keys, so the hash only changes when the
/// data does, not when a struct gains a reordered field.
fn database_version(snapshot: &DatabaseSnapshot) -> AppResult<String> {
    let value = serde_json::to_value(snapshot).map_err(|err| {
        tracing::error!(error = %err, "failed to serialize snapshot");
        AppError::internal("serialization error")
    })?;
    let canonical = serde_json::to_string(&sort_keys(value)).map_err(|err| {
        tracing::error!(error = %err, "failed to serialize canonical snapshot");
        AppError::internal("serialization error")
    })?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{digest:x}")[..16].to_string())
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(map[&key].clone()));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

async fn get_database(
    State(state): State<AppState>,
    Path(gateway_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = gateway_owner(&state.db, &gateway_id).await?;
    let snapshot = load_snapshot(&state.db, user_id).await?;
    let version = database_version(&snapshot)?;

    let client_version = headers
        .get(DB_VERSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if client_version == version {
        return Ok(Json(serde_json::json!({
            "needs_update": false,
            "version": version,
        })));
    }

    Ok(Json(serde_json::json!({
        "needs_update": true,
        "version": version,
        "database": snapshot,
    })))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(gateway_id): Path<String>,
) -> AppResult<Json<Value>> {
    let result = sqlx::query(
        r#"
        UPDATE gateways
        SET last_seen = now(), status = 'online'
        WHERE gateway_id = $1
        "#,
    )
    .bind(&gateway_id)
    .execute(&state.db)
    .await
    .map_err(AppError::from_db)?;

    if result.rows_affected() == 0 {
        return Err(AppError::new(
            axum::http::StatusCode::NOT_FOUND,
            "unknown gateway",
        ));
    }

    Ok(Json(serde_json::json!({ "ok": true })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sync/database/{gateway_id}", get(get_database))
        .route("/sync/heartbeat/{gateway_id}", post(heartbeat))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_snapshot() -> DatabaseSnapshot {
        DatabaseSnapshot {
            passwords: vec![],
            rfid_cards: vec![],
            devices: vec![],
        }
    }

    #[test]
    fn database_version_is_independent_of_field_order() {
        let snapshot = empty_snapshot();
        let a = sort_keys(serde_json::json!({"b": 1, "a": 2}));
        let b = sort_keys(serde_json::json!({"a": 2, "b": 1}));
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
        assert_eq!(database_version(&snapshot).unwrap().len(), 16);
    }

    #[test]
    fn database_version_is_deterministic() {
        let snapshot = empty_snapshot();
        assert_eq!(
            database_version(&snapshot).unwrap(),
            database_version(&snapshot).unwrap()
        );
    }
}
