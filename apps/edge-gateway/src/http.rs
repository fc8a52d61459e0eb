//! Local HTTP surface: `/healthz` and an ambient `/stats` snapshot
//! aggregating the frame codec, security core and router counters,
//! following `node-forwarder/src/http.rs`'s minimal local-router shape.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::frame::FrameCodecStats;
use crate::router::EventRouter;
use crate::security::{SecurityCore, SecurityStats};

#[derive(Clone)]
pub struct HttpState {
    pub security: Arc<SecurityCore>,
    pub router: Arc<EventRouter>,
    pub frame_stats: Arc<AsyncMutex<FrameCodecStats>>,
}

#[derive(Debug, Serialize)]
struct GatewayStats {
    security: SecurityStats,
    frame_codec: FrameCodecStats,
    pending_commands: usize,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stats(State(state): State<HttpState>) -> Json<GatewayStats> {
    let frame_codec = *state.frame_stats.lock().await;
    Json(GatewayStats {
        security: state.security.statistics(),
        frame_codec,
        pending_commands: state.router.pending_command_count(),
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .with_state(state)
}
