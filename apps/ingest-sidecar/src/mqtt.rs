//! Cloud ingest listener (C8): subscribes the whole `gateway/#` topic tree,
//! parses `gateway/{gid}/{kind}/{entity}` and dispatches by kind, with a
//! reconnect loop around the subscribe.

use crate::config::Config;
use crate::ingest::TelemetryIngestor;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Deserialize, Default)]
struct TelemetryPayload {
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    humidity: Option<f64>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AccessPayload {
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    method: String,
    result: String,
    #[serde(default)]
    password_id: Option<Uuid>,
    #[serde(default)]
    rfid_uid: Option<String>,
    #[serde(default)]
    deny_reason: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    status: String,
    #[serde(default)]
    command_id: Option<String>,
}

pub async fn run_listener(config: Config, ingestor: TelemetryIngestor) -> Result<()> {
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(username.clone(), config.mqtt_password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 256);
        let filter = format!("{}/#", config.mqtt_topic_prefix);
        if let Err(err) = client.subscribe(&filter, QoS::AtLeastOnce).await {
            tracing::warn!(error = %err, "failed to subscribe to gateway topics, retrying");
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        tracing::info!(filter = %filter, "ingest listener subscribed");

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("ingest MQTT connected");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Err(err) = dispatch(&config, &ingestor, &publish.topic, &publish.payload).await {
                        tracing::warn!(error = %err, topic = %publish.topic, "failed to ingest message");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "ingest MQTT event loop error, reconnecting");
                    break;
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn dispatch(
    config: &Config,
    ingestor: &TelemetryIngestor,
    topic: &str,
    payload: &[u8],
) -> Result<()> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != config.mqtt_topic_prefix {
        return Ok(());
    }
    let gateway_id = parts[1];
    let kind = parts[2];
    let entity = parts[3];

    match kind {
        "telemetry" => {
            let body: TelemetryPayload = serde_json::from_slice(payload).unwrap_or_default();
            let time = ingestor.normalize_timestamp(body.timestamp);
            ingestor
                .ingest_telemetry(
                    gateway_id,
                    entity,
                    time,
                    body.temperature,
                    body.humidity,
                    body.metadata.unwrap_or(Value::Null),
                )
                .await?;
        }
        "access" => {
            let body: AccessPayload = serde_json::from_slice(payload)?;
            let time = ingestor.normalize_timestamp(body.timestamp);
            ingestor
                .ingest_access(
                    gateway_id,
                    entity,
                    time,
                    &body.method,
                    &body.result,
                    body.password_id,
                    body.rfid_uid.as_deref(),
                    body.deny_reason.as_deref(),
                    body.metadata.unwrap_or(Value::Null),
                )
                .await?;
        }
        "status" if entity == "gateway" => {
            let body: StatusPayload = serde_json::from_slice(payload)?;
            let time = ingestor.normalize_timestamp(body.timestamp);
            ingestor.ingest_gateway_status(gateway_id, time).await?;
        }
        "status" => {
            let body: StatusPayload = serde_json::from_slice(payload)?;
            let time = ingestor.normalize_timestamp(body.timestamp);
            ingestor
                .ingest_device_status(gateway_id, entity, time, &body.status, body.command_id.as_deref())
                .await?;
        }
        "alert" => {
            tracing::debug!(gateway_id, entity, "alert topic observed, no persistence required");
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn telemetry_payload_defaults_are_permissive() {
        let payload: super::TelemetryPayload = serde_json::from_str("{}").unwrap();
        assert!(payload.temperature.is_none());
        assert!(payload.humidity.is_none());
    }
}
