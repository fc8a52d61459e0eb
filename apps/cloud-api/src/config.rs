use anyhow::{Context, Result};
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_topic_prefix: String,
    pub command_expiry_s: i64,
    pub command_sweep_interval_s: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("CLOUD_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("CLOUD_DATABASE_URL or DATABASE_URL is required")?;

        let host = env::var("CLOUD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("CLOUD_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8080);

        let mqtt_host = env::var("CLOUD_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = env::var("CLOUD_MQTT_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8883);
        let mqtt_username = env::var("CLOUD_MQTT_USERNAME").ok();
        let mqtt_password = env::var("CLOUD_MQTT_PASSWORD").ok();
        let mqtt_client_id = env::var("CLOUD_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("cloud-api-{}", std::process::id()));
        let mqtt_topic_prefix =
            env::var("CLOUD_MQTT_TOPIC_PREFIX").unwrap_or_else(|_| "gateway".to_string());

        let command_expiry_s = env::var("CLOUD_COMMAND_EXPIRY_S")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(30);
        let command_sweep_interval_s = env::var("CLOUD_COMMAND_SWEEP_INTERVAL_S")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5);

        Ok(Self {
            database_url,
            host,
            port,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_topic_prefix,
            command_expiry_s,
            command_sweep_interval_s,
        })
    }
}
