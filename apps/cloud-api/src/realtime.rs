//! Real-time fan-out (C10): a single broadcast channel fed by Postgres
//! NOTIFY events from `ingest-sidecar`, drained by one pump per WebSocket
//! connection. Each pump races a broadcast-receiver branch against a
//! client-frame branch, first exit wins. Bearer tokens are verified via
//! an opaque-token -> SHA-256 hash -> DB lookup against `realtime_tokens`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 1024;
const LISTEN_CHANNEL: &str = "realtime_events";

#[derive(Debug, Clone)]
pub struct RealtimeEvent {
    pub user_id: Uuid,
    pub envelope: Value,
}

/// Single process-wide broadcast queue. Every connected WebSocket holds its
/// own `Receiver` and filters for its own `user_id`; a receiver that falls
/// behind just skips the messages it lagged on rather than blocking senders.
pub struct Broadcaster {
    tx: broadcast::Sender<Arc<RealtimeEvent>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RealtimeEvent>> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RealtimeEvent) {
        let _ = self.tx.send(Arc::new(event));
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscribes to the `realtime_events` Postgres channel and republishes each
/// payload on the in-process broadcaster. Bridges `ingest-sidecar` (a
/// separate binary sharing only the database) into this process's fan-out.
pub fn start_pg_listener(
    pool: PgPool,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match sqlx::postgres::PgListener::connect_with(&pool).await {
                Ok(mut listener) => {
                    if let Err(err) = listener.listen(LISTEN_CHANNEL).await {
                        tracing::warn!(error = %err, "failed to LISTEN on realtime_events, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        continue;
                    }
                    tracing::info!("subscribed to realtime_events");
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            notification = listener.recv() => {
                                match notification {
                                    Ok(notification) => {
                                        if let Some(event) = parse_notification(notification.payload()) {
                                            broadcaster.publish(event);
                                        }
                                    }
                                    Err(err) => {
                                        tracing::warn!(error = %err, "realtime listener error, reconnecting");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to connect realtime listener, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
            }
        }
    })
}

fn parse_notification(payload: &str) -> Option<RealtimeEvent> {
    let envelope: Value = serde_json::from_str(payload).ok()?;
    let user_id = envelope.get("user_id")?.as_str()?;
    let user_id = Uuid::parse_str(user_id).ok()?;
    Some(RealtimeEvent { user_id, envelope })
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.trim().as_bytes());
    format!("{digest:x}")
}

async fn verify_token(pool: &PgPool, token: &str) -> Option<Uuid> {
    let token_hash = hash_token(token);
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT user_id FROM realtime_tokens
        WHERE token_hash = $1 AND (expires_at IS NULL OR expires_at > now())
        "#,
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await
    .ok()?;
    row.map(|(user_id,)| user_id)
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub async fn upgrade(
    State(pool): State<PgPool>,
    State(broadcaster): State<Arc<Broadcaster>>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    let Some(user_id) = verify_token(&pool, &token).await else {
        return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, user_id, broadcaster))
}

async fn handle_socket(mut socket: WebSocket, user_id: Uuid, broadcaster: Arc<Broadcaster>) {
    let mut rx = broadcaster.subscribe();

    let hello = serde_json::json!({ "type": "connection", "status": "established" });
    if socket
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) if event.user_id == user_id => {
                        if socket.send(Message::Text(event.envelope.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, %user_id, "realtime subscriber lagged, dropping messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Ping(_))) => {
                        let pong = serde_json::json!({ "type": "pong" });
                        if socket.send(Message::Text(pong.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_notification() {
        let payload = serde_json::json!({
            "type": "telemetry",
            "user_id": "11111111-2222-3333-4444-555555555555",
            "device_id": "d1",
        })
        .to_string();
        let event = parse_notification(&payload).expect("event parses");
        assert_eq!(
            event.user_id.to_string(),
            "11111111-2222-3333-4444-555555555555"
        );
    }

    #[test]
    fn rejects_notification_without_user_id() {
        let payload = serde_json::json!({ "type": "telemetry" }).to_string();
        assert!(parse_notification(&payload).is_none());
    }

    #[test]
    fn hash_token_is_deterministic() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_ne!(hash_token("abc"), hash_token("abd"));
    }
}
