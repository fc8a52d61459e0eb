//! Minimal local HTTP surface, following `edge-gateway/src/http.rs`'s
//! `/healthz` + `/stats` shape.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::pipeline::IngestStats;

#[derive(Clone)]
pub struct HttpState {
    pub stats: Arc<IngestStats>,
}

#[derive(Debug, Serialize)]
struct StatsView {
    queue_depth: u64,
    last_flush_unix_ms: u64,
    last_batch_len: u64,
    average_flush_micros: u64,
    inflight_flushes: u64,
    mqtt_connected: bool,
    last_error: Option<String>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stats(State(state): State<HttpState>) -> Json<StatsView> {
    use std::sync::atomic::Ordering;
    Json(StatsView {
        queue_depth: state.stats.queue_depth.load(Ordering::Relaxed),
        last_flush_unix_ms: state.stats.last_flush_unix_ms.load(Ordering::Relaxed),
        last_batch_len: state.stats.last_batch_len.load(Ordering::Relaxed),
        average_flush_micros: state.stats.average_flush_micros.load(Ordering::Relaxed),
        inflight_flushes: state.stats.inflight_flushes.load(Ordering::Relaxed),
        mqtt_connected: state.stats.mqtt_connected.load(Ordering::Relaxed),
        last_error: state.stats.last_error.lock().ok().and_then(|e| e.clone()),
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .with_state(state)
}
