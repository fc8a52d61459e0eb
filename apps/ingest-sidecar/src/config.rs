use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub device_timeout_s: u64,
    pub gateway_timeout_s: u64,
    pub offline_check_interval_s: u64,
    pub timestamp_drift_s: i64,
    pub http_bind: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env::var("INGEST_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("INGEST_DATABASE_URL or DATABASE_URL is required")?;
        let database_url = normalize_database_url(database_url);

        let mqtt_host = env::var("INGEST_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = env::var("INGEST_MQTT_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8883);
        let mqtt_username = env::var("INGEST_MQTT_USERNAME").ok();
        let mqtt_password = env::var("INGEST_MQTT_PASSWORD").ok();
        let mqtt_topic_prefix =
            env::var("INGEST_MQTT_TOPIC_PREFIX").unwrap_or_else(|_| "gateway".to_string());
        let mqtt_keepalive_secs = env::var("INGEST_MQTT_KEEPALIVE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);
        let mqtt_client_id = env::var("INGEST_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("ingest-sidecar-{}", std::process::id()));

        let batch_size = env::var("INGEST_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(200);
        let flush_interval_ms = env::var("INGEST_FLUSH_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(500);
        let max_queue = env::var("INGEST_MAX_QUEUE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(batch_size * 10);
        let db_pool_size = env::var("INGEST_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);

        let device_timeout_s = env::var("INGEST_DEVICE_TIMEOUT_S")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(90);
        let gateway_timeout_s = env::var("INGEST_GATEWAY_TIMEOUT_S")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(90);
        let offline_check_interval_s = env::var("INGEST_OFFLINE_CHECK_INTERVAL_S")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10);
        let timestamp_drift_s = env::var("INGEST_TIMESTAMP_DRIFT_S")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(300);
        let http_bind =
            env::var("INGEST_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8091".to_string());

        Ok(Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            batch_size,
            flush_interval_ms,
            max_queue,
            device_timeout_s,
            gateway_timeout_s,
            offline_check_interval_s,
            timestamp_drift_s,
            http_bind,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn device_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.device_timeout_s as i64)
    }

    pub fn gateway_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.gateway_timeout_s as i64)
    }

    pub fn offline_check_interval(&self) -> Duration {
        Duration::from_secs(self.offline_check_interval_s)
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
