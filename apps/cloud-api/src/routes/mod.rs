pub mod health;

use axum::routing::get;
use axum::Router;

use crate::realtime;
use crate::state::AppState;
use crate::sync;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .route("/ws/realtime", get(realtime::upgrade))
        .nest("/api", sync::router())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn realtime_upgrade_requires_bearer_auth() {
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/does-not-matter")
            .expect("lazy pool never touches the network");
        let state = AppState {
            config: crate::config::Config {
                database_url: "postgres://localhost/does-not-matter".to_string(),
                host: "127.0.0.1".to_string(),
                port: 0,
                mqtt_host: "127.0.0.1".to_string(),
                mqtt_port: 1883,
                mqtt_username: None,
                mqtt_password: None,
                mqtt_client_id: "test".to_string(),
                mqtt_topic_prefix: "gateway".to_string(),
                command_expiry_s: 30,
                command_sweep_interval_s: 5,
            },
            db: pool,
            mqtt: std::sync::Arc::new(crate::services::mqtt::MqttPublisher::new_disconnected()),
            broadcaster: std::sync::Arc::new(realtime::Broadcaster::new()),
        };

        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws/realtime")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
