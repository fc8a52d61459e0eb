//! Cloud MQTT transport (C6): mTLS client to the cloud broker. Publishes
//! telemetry/access/status/alert/gateway-status topics, subscribes command
//! and sync-trigger topics, and tracks connection state for the
//! store-and-forward buffer's flush decision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::router::CloudLink;

#[derive(Debug, Clone)]
pub enum CloudEvent {
    Command { command_id: String, device_id: String, cmd: String, params: Value },
    SyncTrigger,
}

pub struct CloudMqtt {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    reconnected: Arc<Notify>,
}

impl CloudMqtt {
    /// Fires each time the broker connection comes up (including the
    /// initial connect), so the store-and-forward flush loop knows when to
    /// attempt a drain.
    pub fn reconnected(&self) -> Arc<Notify> {
        self.reconnected.clone()
    }
}

#[async_trait]
impl CloudLink for CloudMqtt {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: String, payload: Value) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(&payload)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await?;
        Ok(())
    }
}

pub struct CloudMqttConfig {
    pub host: String,
    pub port: u16,
    pub gateway_id: String,
    pub ca: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

fn mqtt_options(cfg: &CloudMqttConfig) -> MqttOptions {
    let client_id = format!("gateway-{}", cfg.gateway_id);
    let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
        ca: cfg.ca.clone(),
        alpn: None,
        client_auth: Some((cfg.client_cert.clone(), cfg.client_key.clone())),
    }));

    let offline_topic = format!("gateway/{}/status/gateway", cfg.gateway_id);
    options.set_last_will(rumqttc::LastWill::new(
        offline_topic,
        serde_json::to_vec(&json!({"status": "offline"})).unwrap(),
        QoS::AtLeastOnce,
        true,
    ));
    options
}

pub fn start(
    cfg: CloudMqttConfig,
    event_tx: mpsc::Sender<CloudEvent>,
    cancel: CancellationToken,
) -> (Arc<CloudMqtt>, tokio::task::JoinHandle<()>) {
    let gateway_id = cfg.gateway_id.clone();
    let options = mqtt_options(&cfg);
    let (client, mut eventloop) = AsyncClient::new(options, 128);
    let connected = Arc::new(AtomicBool::new(false));
    let reconnected = Arc::new(Notify::new());
    let handle_client = client.clone();
    let handle_connected = connected.clone();
    let handle_reconnected = reconnected.clone();

    let handle = tokio::spawn(async move {
        let command_filter = format!("gateway/{gateway_id}/command/#");
        let trigger_filter = format!("gateway/{gateway_id}/sync/trigger");
        let _ = handle_client.subscribe(&command_filter, QoS::AtLeastOnce).await;
        let _ = handle_client.subscribe(&trigger_filter, QoS::AtLeastOnce).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            handle_connected.store(true, Ordering::SeqCst);
                            handle_reconnected.notify_one();
                            info!("cloud MQTT connected");
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if let Some(evt) = parse_publish(&gateway_id, &publish.topic, &publish.payload) {
                                if event_tx.send(evt).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            handle_connected.store(false, Ordering::SeqCst);
                            warn!(error = %err, "cloud MQTT event loop error, backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    });

    (Arc::new(CloudMqtt { client, connected, reconnected }), handle)
}

fn parse_publish(gateway_id: &str, topic: &str, payload: &[u8]) -> Option<CloudEvent> {
    let trigger_topic = format!("gateway/{gateway_id}/sync/trigger");
    if topic == trigger_topic {
        return Some(CloudEvent::SyncTrigger);
    }
    let prefix = format!("gateway/{gateway_id}/command/");
    let device_id = topic.strip_prefix(&prefix)?.to_string();
    let value: Value = serde_json::from_slice(payload).ok()?;
    Some(CloudEvent::Command {
        command_id: value.get("command_id")?.as_str()?.to_string(),
        device_id,
        cmd: value.get("cmd")?.as_str()?.to_string(),
        params: value.get("params").cloned().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_topic() {
        let payload = br#"{"command_id":"c1","cmd":"fan_on","params":{}}"#;
        let evt = parse_publish("gw1", "gateway/gw1/command/fan_01", payload).unwrap();
        match evt {
            CloudEvent::Command { command_id, device_id, cmd, .. } => {
                assert_eq!(command_id, "c1");
                assert_eq!(device_id, "fan_01");
                assert_eq!(cmd, "fan_on");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_sync_trigger_topic() {
        let evt = parse_publish("gw1", "gateway/gw1/sync/trigger", b"{}").unwrap();
        assert!(matches!(evt, CloudEvent::SyncTrigger));
    }
}
