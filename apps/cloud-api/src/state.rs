use crate::config::Config;
use crate::realtime::Broadcaster;
use crate::services::mqtt::MqttPublisher;
use axum::extract::FromRef;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: PgPool,
    pub mqtt: Arc<MqttPublisher>,
    pub broadcaster: Arc<Broadcaster>,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}

impl FromRef<AppState> for Arc<Broadcaster> {
    fn from_ref(state: &AppState) -> Arc<Broadcaster> {
        state.broadcaster.clone()
    }
}
