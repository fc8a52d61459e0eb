//! Local MQTT transport (C5): TLS client talking to the on-site broker.
//! Subscribes `home/devices/+/telemetry|request|status`, publishes
//! `home/devices/{device_id}/command`. QoS 1 throughout, following the
//! `mqtt_options()`/`AsyncClient` construction idiom in
//! `node-forwarder/src/mqtt.rs`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::router::LocalPublish;

#[derive(Debug, Clone)]
pub enum LocalEvent {
    Telemetry { device_id: String, data: Value },
    Request { device_id: String, body: String, hmac: String },
    Status { device_id: String, status: Value },
}

pub struct LocalMqtt {
    client: AsyncClient,
}

#[async_trait]
impl LocalPublish for LocalMqtt {
    async fn publish(&self, topic: String, payload: Value) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(&payload)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await?;
        Ok(())
    }
}

pub struct LocalMqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_ca: Option<Vec<u8>>,
}

fn mqtt_options(cfg: &LocalMqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        options.set_credentials(user.clone(), pass.clone());
    }
    if let Some(ca) = &cfg.tls_ca {
        options.set_transport(Transport::tls_with_config(
            rumqttc::TlsConfiguration::Simple {
                ca: ca.clone(),
                alpn: None,
                client_auth: None,
            },
        ));
    }
    options
}

/// Starts the local MQTT client event loop, emitting parsed `LocalEvent`s on
/// `event_tx` for the router to consume.
pub fn start(
    cfg: LocalMqttConfig,
    event_tx: mpsc::Sender<LocalEvent>,
    cancel: CancellationToken,
) -> (Arc<LocalMqtt>, tokio::task::JoinHandle<()>) {
    let options = mqtt_options(&cfg);
    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let handle_client = client.clone();

    let handle = tokio::spawn(async move {
        let sub_client = handle_client.clone();
        let _ = sub_client
            .subscribe("home/devices/+/telemetry", QoS::AtLeastOnce)
            .await;
        let _ = sub_client
            .subscribe("home/devices/+/request", QoS::AtLeastOnce)
            .await;
        let _ = sub_client
            .subscribe("home/devices/+/status", QoS::AtLeastOnce)
            .await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if let Some(evt) = parse_publish(&publish.topic, &publish.payload) {
                                if event_tx.send(evt).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "local MQTT event loop error, backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    });

    (Arc::new(LocalMqtt { client }), handle)
}

fn parse_publish(topic: &str, payload: &[u8]) -> Option<LocalEvent> {
    let parts: Vec<&str> = topic.split('/').collect();
    // home / devices / {device_id} / {kind}
    if parts.len() != 4 || parts[0] != "home" || parts[1] != "devices" {
        return None;
    }
    let device_id = parts[2].to_string();
    let kind = parts[3];
    let value: Value = serde_json::from_slice(payload).ok()?;

    match kind {
        "telemetry" => {
            let data = value.get("data").cloned().unwrap_or(value);
            Some(LocalEvent::Telemetry { device_id, data })
        }
        "request" => {
            let body = value.get("body")?.as_str()?.to_string();
            let hmac = value.get("hmac")?.as_str()?.to_string();
            Some(LocalEvent::Request { device_id, body, hmac })
        }
        "status" => Some(LocalEvent::Status { device_id, status: value }),
        other => {
            debug!(kind = other, "unrecognized local topic kind");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_topic() {
        let payload = br#"{"body":"x","hmac":"y"}"#;
        let event = parse_publish("home/devices/keypad_01/request", payload).unwrap();
        match event {
            LocalEvent::Request { device_id, body, hmac } => {
                assert_eq!(device_id, "keypad_01");
                assert_eq!(body, "x");
                assert_eq!(hmac, "y");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ignores_unrelated_topics() {
        assert!(parse_publish("other/topic", b"{}").is_none());
    }
}
