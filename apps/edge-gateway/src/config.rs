use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;

/// Runtime tunables, loaded from `GATEWAY_*` environment variables via the
/// `env_string`/`env_u64`/`env_bool` helpers below.
#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_id: String,

    pub serial_port: String,
    pub serial_baud: u32,

    pub local_host: String,
    pub local_port: u16,
    pub local_tls_ca: Option<PathBuf>,
    pub local_username: Option<String>,
    pub local_password: Option<String>,

    pub cloud_host: String,
    pub cloud_port: u16,
    pub cloud_tls_ca: PathBuf,
    pub cloud_tls_cert: PathBuf,
    pub cloud_tls_key: PathBuf,

    pub hmac_key: Vec<u8>,

    pub max_failed_attempts: u32,
    pub lockout_duration_s: u64,
    pub ts_tolerance_s: i64,
    pub nonce_cache_size: usize,
    pub rate_limit_window_s: u64,
    pub rate_limit_max_requests: u32,

    pub heartbeat_interval_s: u64,
    pub offline_check_interval_s: u64,
    pub device_timeout_s: u64,
    pub gateway_timeout_s: u64,

    pub sync_interval_s: u64,
    pub cloud_api_base_url: String,

    pub buffer_max: usize,
    pub flush_rate_per_sec: u32,

    pub data_dir: PathBuf,

    pub temp_device_id: String,
    pub fan_device_id: String,
    pub auto_fan_enabled: bool,
    pub temp_threshold_c: f64,

    pub http_bind: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let gateway_id = env_string("GATEWAY_ID", "gateway-1");

        let serial_port = env_string("GATEWAY_SERIAL_PORT", "/dev/ttyUSB0");
        let serial_baud = env_u32("GATEWAY_SERIAL_BAUD", 9600);

        let local_host = env_string("GATEWAY_LOCAL_MQTT_HOST", "127.0.0.1");
        let local_port = env_u16("GATEWAY_LOCAL_MQTT_PORT", 8883);
        let local_tls_ca = env_optional_path("GATEWAY_LOCAL_TLS_CA");
        let local_username = env_optional("GATEWAY_LOCAL_MQTT_USERNAME");
        let local_password = env_optional("GATEWAY_LOCAL_MQTT_PASSWORD");

        let cloud_host = env_string("GATEWAY_CLOUD_MQTT_HOST", "mqtt.cloud.example.com");
        let cloud_port = env_u16("GATEWAY_CLOUD_MQTT_PORT", 8883);
        let cloud_tls_ca = env_path("GATEWAY_CLOUD_TLS_CA", "./certs/ca.pem")
            .context("GATEWAY_CLOUD_TLS_CA")?;
        let cloud_tls_cert = env_path("GATEWAY_CLOUD_TLS_CERT", "./certs/client.pem")
            .context("GATEWAY_CLOUD_TLS_CERT")?;
        let cloud_tls_key = env_path("GATEWAY_CLOUD_TLS_KEY", "./certs/client.key")
            .context("GATEWAY_CLOUD_TLS_KEY")?;

        let hmac_key_hex = env::var("GATEWAY_HMAC_KEY")
            .context("GATEWAY_HMAC_KEY must be set (32-byte key, hex-encoded)")?;
        let hmac_key = hex_decode(hmac_key_hex.trim()).context("GATEWAY_HMAC_KEY is not valid hex")?;
        if hmac_key.len() != 32 {
            return Err(anyhow!(
                "GATEWAY_HMAC_KEY must decode to 32 bytes, got {}",
                hmac_key.len()
            ));
        }

        let max_failed_attempts = env_u32("GATEWAY_MAX_FAILED_ATTEMPTS", 5);
        let lockout_duration_s = env_u64("GATEWAY_LOCKOUT_DURATION_S", 300);
        let ts_tolerance_s = env_u64("GATEWAY_TS_TOLERANCE_S", 300) as i64;
        let nonce_cache_size = env_u64("GATEWAY_NONCE_CACHE_SIZE", 1000) as usize;
        let rate_limit_window_s = env_u64("GATEWAY_RATE_LIMIT_WINDOW_S", 60);
        let rate_limit_max_requests = env_u32("GATEWAY_RATE_LIMIT_MAX_REQUESTS", 10);

        let heartbeat_interval_s = env_u64("GATEWAY_HEARTBEAT_INTERVAL_S", 30);
        let offline_check_interval_s = env_u64("GATEWAY_OFFLINE_CHECK_INTERVAL_S", 10);
        let device_timeout_s = env_u64("GATEWAY_DEVICE_TIMEOUT_S", 90);
        let gateway_timeout_s = env_u64("GATEWAY_GATEWAY_TIMEOUT_S", 90);

        let sync_interval_s = env_u64("GATEWAY_SYNC_INTERVAL_S", 5);
        let cloud_api_base_url =
            env_string("GATEWAY_CLOUD_API_BASE_URL", "https://api.cloud.example.com");

        let buffer_max = env_u64("GATEWAY_BUFFER_MAX", 1000) as usize;
        let flush_rate_per_sec = env_u32("GATEWAY_FLUSH_RATE_PER_SEC", 20);

        let data_dir = env_path("GATEWAY_DATA_DIR", "./data").context("GATEWAY_DATA_DIR")?;

        let temp_device_id = env_string("GATEWAY_TEMP_DEVICE_ID", "temp_sensor_01");
        let fan_device_id = env_string("GATEWAY_FAN_DEVICE_ID", "fan_01");
        let auto_fan_enabled = env_bool("GATEWAY_AUTO_FAN_ENABLED", true);
        let temp_threshold_c = env_f64("GATEWAY_TEMP_THRESHOLD_C", 28.0);

        let http_bind = env_string("GATEWAY_HTTP_BIND", "127.0.0.1:9190");

        Ok(Self {
            gateway_id,
            serial_port,
            serial_baud,
            local_host,
            local_port,
            local_tls_ca,
            local_username,
            local_password,
            cloud_host,
            cloud_port,
            cloud_tls_ca,
            cloud_tls_cert,
            cloud_tls_key,
            hmac_key,
            max_failed_attempts,
            lockout_duration_s,
            ts_tolerance_s,
            nonce_cache_size,
            rate_limit_window_s,
            rate_limit_max_requests,
            heartbeat_interval_s,
            offline_check_interval_s,
            device_timeout_s,
            gateway_timeout_s,
            sync_interval_s,
            cloud_api_base_url,
            buffer_max,
            flush_rate_per_sec,
            data_dir,
            temp_device_id,
            fan_device_id,
            auto_fan_enabled,
            temp_threshold_c,
            http_bind,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_optional_path(key: &str) -> Option<PathBuf> {
    env_optional(key).map(PathBuf::from)
}

fn env_path(key: &str, default: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(env_string(key, default)))
}

fn env_u16(key: &str, default: u16) -> u16 {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key).ok().map(|v| v.trim().to_lowercase()) {
        Some(v) if v == "1" || v == "true" || v == "yes" => true,
        Some(v) if v == "0" || v == "false" || v == "no" => false,
        _ => default,
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(anyhow!("odd-length hex string"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| anyhow!(e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_decode_roundtrip() {
        let bytes = hex_decode("00ff10").unwrap();
        assert_eq!(bytes, vec![0x00, 0xff, 0x10]);
    }

    #[test]
    fn hex_decode_rejects_odd_length() {
        assert!(hex_decode("abc").is_err());
    }
}
