//! Event router (C7): dispatches telemetry/request/status messages from the
//! three ingress queues (LoRa frames, local MQTT, cloud commands), applies
//! access rules and temperature-driven fan automation, and maintains the
//! pending-command table used to detect command expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::buffer::ForwardBuffer;
use crate::credentials::{AuthMethod, CredentialStore};
use crate::security::{AuthFailureReason, SecurityCore};

#[async_trait]
pub trait LocalPublish: Send + Sync {
    async fn publish(&self, topic: String, payload: Value) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CloudLink: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn publish(&self, topic: String, payload: Value) -> anyhow::Result<()>;
}

#[async_trait]
pub trait LoraSend: Send + Sync {
    async fn send_response(&self, address: u16, channel: u8, body: String) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command_id: String,
    pub device_id: String,
    pub issued_at: Instant,
}

pub struct EventRouter {
    gateway_id: String,
    security: Arc<SecurityCore>,
    credentials: Arc<CredentialStore>,
    buffer: Arc<ForwardBuffer>,
    local: Arc<dyn LocalPublish>,
    cloud: Arc<dyn CloudLink>,
    lora: Arc<dyn LoraSend>,
    temp_device_id: String,
    fan_device_id: String,
    pending_commands: Mutex<HashMap<String, PendingCommand>>,
    fan_is_on: Mutex<Option<bool>>,
}

#[derive(Debug, Clone)]
pub struct DeviceRequest {
    pub device_id: String,
    pub body: String,
    pub hmac: String,
}

#[derive(Debug, Clone)]
pub struct CloudCommand {
    pub command_id: String,
    pub device_id: String,
    pub cmd: String,
    pub params: Value,
}

impl EventRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway_id: String,
        security: Arc<SecurityCore>,
        credentials: Arc<CredentialStore>,
        buffer: Arc<ForwardBuffer>,
        local: Arc<dyn LocalPublish>,
        cloud: Arc<dyn CloudLink>,
        lora: Arc<dyn LoraSend>,
        temp_device_id: String,
        fan_device_id: String,
    ) -> Self {
        Self {
            gateway_id,
            security,
            credentials,
            buffer,
            local,
            cloud,
            lora,
            temp_device_id,
            fan_device_id,
            pending_commands: Mutex::new(HashMap::new()),
            fan_is_on: Mutex::new(None),
        }
    }

    async fn forward_to_cloud(&self, topic: &str, payload: Value) {
        if self.cloud.is_connected() {
            if let Err(err) = self.cloud.publish(topic.to_string(), payload.clone()).await {
                warn!(error = %err, topic, "cloud publish failed, buffering");
                self.buffer_with_warn(topic, payload);
            }
        } else {
            self.buffer_with_warn(topic, payload);
        }
    }

    fn buffer_with_warn(&self, topic: &str, payload: Value) {
        if self.buffer.enqueue(topic, payload) {
            warn!(topic, "store-and-forward buffer overflow, oldest entry discarded");
        }
    }

    /// Telemetry dispatch: runs fan automation for the configured temperature
    /// device, then forwards the sample to the cloud.
    pub async fn handle_telemetry(&self, device_id: &str, data: Value) {
        self.credentials.upsert_device(crate::credentials::DeviceRecord {
            device_id: device_id.to_string(),
            device_type: "temperature_sensor".to_string(),
            status: "online".to_string(),
            last_seen: Some(Utc::now()),
        });

        if device_id == self.temp_device_id {
            if let Some(temp) = data.get("temperature").and_then(|v| v.as_f64()) {
                self.run_fan_automation(temp).await;
            }
        }

        let topic = format!("gateway/{}/telemetry/{}", self.gateway_id, device_id);
        self.forward_to_cloud(&topic, data).await;
    }

    /// Edge-triggered: a command and alert fire only on a fan on/off
    /// transition, not on every sample that happens to sit past the
    /// threshold. `fan_is_on == None` (unknown) is treated as eligible for
    /// either transition, so the first sample after startup still acts.
    async fn run_fan_automation(&self, temperature: f64) {
        let automation = self.credentials.automation();
        if !automation.auto_fan_enabled {
            return;
        }
        let fan_should_be_on = temperature >= automation.temp_threshold;
        {
            let mut fan_is_on = self.fan_is_on.lock().unwrap();
            if *fan_is_on == Some(fan_should_be_on) {
                return;
            }
            *fan_is_on = Some(fan_should_be_on);
        }
        let cmd = if fan_should_be_on { "fan_on" } else { "fan_off" };
        let payload = json!({
            "cmd": cmd,
            "user": "automation_engine",
            "trigger": "temperature_threshold",
            "temperature": temperature,
            "threshold": automation.temp_threshold,
        });
        let topic = format!("home/devices/{}/command", self.fan_device_id);
        if let Err(err) = self.local.publish(topic, payload).await {
            warn!(error = %err, "failed to publish fan automation command");
            *self.fan_is_on.lock().unwrap() = None;
            return;
        }
        let alert = json!({
            "type": "automation_trigger",
            "device_id": self.fan_device_id,
            "temperature": temperature,
            "threshold": automation.temp_threshold,
        });
        let alert_topic = format!("gateway/{}/alert/{}", self.gateway_id, self.fan_device_id);
        self.forward_to_cloud(&alert_topic, alert).await;
    }

    /// Runs the §4.2 auth pipeline against a `home/devices/{did}/request`
    /// message, replies locally with LOCK/OPEN, and emits an access log.
    pub async fn handle_request(&self, req: DeviceRequest) {
        let result = self.run_auth_pipeline(&req).await;

        let (reply_cmd, reason, method, result_str) = match &result {
            PipelineOutcome::Granted { password_id } => (
                "OPEN".to_string(),
                None,
                "passkey".to_string(),
                "granted".to_string(),
            ),
            PipelineOutcome::Denied(reason) => (
                "LOCK".to_string(),
                Some(reason.clone()),
                "passkey".to_string(),
                "denied".to_string(),
            ),
            PipelineOutcome::DeniedByRule(_password_id, reason) => (
                "LOCK".to_string(),
                Some(reason.clone()),
                "passkey".to_string(),
                "denied".to_string(),
            ),
        };

        let mut reply = json!({ "cmd": reply_cmd });
        if let Some(ref reason) = reason {
            reply["reason"] = json!(reason);
        }
        let _ = self
            .local
            .publish(format!("home/devices/{}/response", req.device_id), reply)
            .await;

        let password_id = match &result {
            PipelineOutcome::Granted { password_id } => Some(password_id.clone()),
            PipelineOutcome::DeniedByRule(password_id, _) => Some(password_id.clone()),
            PipelineOutcome::Denied(_) => None,
        };

        let access_log = json!({
            "method": method,
            "result": result_str,
            "password_id": password_id,
            "deny_reason": reason,
        });
        let topic = format!("gateway/{}/access/{}", self.gateway_id, req.device_id);
        self.forward_to_cloud(&topic, access_log).await;
    }

    async fn run_auth_pipeline(&self, req: &DeviceRequest) -> PipelineOutcome {
        if self.security.is_locked_out(&req.device_id) {
            return PipelineOutcome::Denied(AuthFailureReason::LockedOut.as_str().to_string());
        }
        if !self.security.check_rate_limit(&req.device_id) {
            return PipelineOutcome::Denied(AuthFailureReason::RateLimited.as_str().to_string());
        }
        if req.body.is_empty() || req.hmac.is_empty() {
            self.security.record_failed_attempt(&req.device_id);
            return PipelineOutcome::Denied(AuthFailureReason::InvalidFormat.as_str().to_string());
        }
        if !self.security.verify_hmac(&req.body, &req.hmac) {
            self.security.record_failed_attempt(&req.device_id);
            self.emit_security_alert(&req.device_id, "invalid_signature").await;
            return PipelineOutcome::Denied(AuthFailureReason::InvalidSignature.as_str().to_string());
        }
        let parsed: Value = match serde_json::from_str(&req.body) {
            Ok(v) => v,
            Err(_) => {
                self.security.record_failed_attempt(&req.device_id);
                return PipelineOutcome::Denied(AuthFailureReason::InvalidJson.as_str().to_string());
            }
        };
        let ts = parsed.get("ts").and_then(|v| v.as_i64()).unwrap_or(0);
        if !self.security.validate_timestamp(ts) {
            self.security.record_failed_attempt(&req.device_id);
            return PipelineOutcome::Denied(AuthFailureReason::InvalidTimestamp.as_str().to_string());
        }
        let nonce = parsed.get("nonce").and_then(|v| v.as_i64()).unwrap_or(-1);
        if !self.security.validate_nonce(nonce) {
            self.security.record_failed_attempt(&req.device_id);
            self.emit_security_alert(&req.device_id, "replay_attack").await;
            return PipelineOutcome::Denied(AuthFailureReason::ReplayAttack.as_str().to_string());
        }

        let cmd = parsed.get("cmd").and_then(|v| v.as_str()).unwrap_or("");
        if cmd != "unlock_request" {
            return PipelineOutcome::Denied("unsupported_command".to_string());
        }

        let pw_hash = parsed.get("pw").and_then(|v| v.as_str()).unwrap_or("");
        match self.credentials.lookup_password(pw_hash) {
            None => {
                self.security.record_failed_attempt(&req.device_id);
                PipelineOutcome::Denied("invalid_password".to_string())
            }
            Some(password_id) => {
                let (allowed, reason) = self.credentials.check_access(
                    AuthMethod::Passkey,
                    &password_id,
                    Utc::now().time(),
                );
                if allowed {
                    self.security.record_success(&req.device_id);
                    self.credentials.mark_password_used(&password_id, Utc::now());
                    self.credentials.set_home_occupied(true);
                    PipelineOutcome::Granted { password_id }
                } else {
                    self.security.record_failed_attempt(&req.device_id);
                    PipelineOutcome::DeniedByRule(
                        password_id,
                        reason.unwrap_or_else(|| "denied".to_string()),
                    )
                }
            }
        }
    }

    async fn emit_security_alert(&self, device_id: &str, reason: &str) {
        let alert = json!({ "type": "security_alert", "device_id": device_id, "reason": reason });
        let topic = format!("gateway/{}/alert/{}", self.gateway_id, device_id);
        self.forward_to_cloud(&topic, alert).await;
    }

    /// RFID path (no HMAC; the radio link is the physical-layer authenticator).
    pub async fn handle_rfid_scan(&self, uid: &str, address: u16, channel: u8) {
        let found = self.credentials.lookup_rfid(uid);
        let (reply, result) = if found {
            ("GRANT".to_string(), "granted")
        } else {
            ("DENY5".to_string(), "denied")
        };
        if let Err(err) = self.lora.send_response(address, channel, reply).await {
            warn!(error = %err, "failed to send LoRa response");
        }
        if found {
            self.credentials.mark_rfid_used(uid, Utc::now());
        }
        let access_log = json!({ "method": "rfid", "result": result, "rfid_uid": uid });
        let topic = format!("gateway/{}/access/rfid_gate_01", self.gateway_id);
        self.forward_to_cloud(&topic, access_log).await;
    }

    /// Status dispatch: forward to cloud; if the message carries a
    /// `command_id`, also resolve the pending command entry.
    pub async fn handle_status(&self, device_id: &str, status: Value) {
        if let Some(command_id) = status.get("command_id").and_then(|v| v.as_str()) {
            self.complete_command(command_id, true).await;
        }
        let topic = format!("gateway/{}/status/{}", self.gateway_id, device_id);
        self.forward_to_cloud(&topic, status).await;
    }

    /// Cloud→device command dispatch. Validates the device is known, logs
    /// the command, and records it as pending for expiry tracking.
    pub async fn handle_cloud_command(&self, cmd: CloudCommand) {
        let topic = format!("home/devices/{}/command", cmd.device_id);
        let payload = json!({ "cmd": cmd.cmd, "params": cmd.params, "command_id": cmd.command_id });
        if let Err(err) = self.local.publish(topic, payload).await {
            warn!(error = %err, command_id = %cmd.command_id, "failed to deliver command to device");
            return;
        }
        self.pending_commands.lock().unwrap().insert(
            cmd.command_id.clone(),
            PendingCommand {
                command_id: cmd.command_id.clone(),
                device_id: cmd.device_id.clone(),
                issued_at: Instant::now(),
            },
        );
        info!(command_id = %cmd.command_id, device_id = %cmd.device_id, "command dispatched");
    }

    async fn complete_command(&self, command_id: &str, success: bool) {
        let removed = self.pending_commands.lock().unwrap().remove(command_id);
        if let Some(pending) = removed {
            let topic = format!("gateway/command/response/{}", pending.device_id);
            let payload = json!({
                "command_id": command_id,
                "status": if success { "completed" } else { "failed" },
            });
            self.forward_to_cloud(&topic, payload).await;
        }
    }

    /// Sweeps the pending-command table every 60 s, expiring entries older
    /// than 30 s and emitting `command_expired`.
    pub async fn sweep_expired_commands(&self) {
        let expiry = Duration::from_secs(30);
        let expired: Vec<PendingCommand> = {
            let mut pending = self.pending_commands.lock().unwrap();
            let now = Instant::now();
            let expired_ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.issued_at) > expiry)
                .map(|(id, _)| id.clone())
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        for pending in expired {
            let topic = format!("gateway/command/response/{}", pending.device_id);
            let payload = json!({ "command_id": pending.command_id, "status": "expired" });
            self.forward_to_cloud(&topic, payload).await;
            warn!(command_id = %pending.command_id, "command_expired");
        }
    }

    pub fn pending_command_count(&self) -> usize {
        self.pending_commands.lock().unwrap().len()
    }
}

#[derive(Debug, Clone)]
enum PipelineOutcome {
    Granted { password_id: String },
    Denied(String),
    DeniedByRule(String, String),
}

pub fn new_command_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingLocal {
        published: AsyncMutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl LocalPublish for RecordingLocal {
        async fn publish(&self, topic: String, payload: Value) -> anyhow::Result<()> {
            self.published.lock().await.push((topic, payload));
            Ok(())
        }
    }

    struct FakeCloud {
        connected: AtomicBool,
        published: AsyncMutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl CloudLink for FakeCloud {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        async fn publish(&self, topic: String, payload: Value) -> anyhow::Result<()> {
            self.published.lock().await.push((topic, payload));
            Ok(())
        }
    }

    struct FakeLora {
        sent: AsyncMutex<Vec<(u16, u8, String)>>,
    }

    #[async_trait]
    impl LoraSend for FakeLora {
        async fn send_response(&self, address: u16, channel: u8, body: String) -> anyhow::Result<()> {
            self.sent.lock().await.push((address, channel, body));
            Ok(())
        }
    }

    fn build_router() -> (
        Arc<EventRouter>,
        Arc<RecordingLocal>,
        Arc<FakeCloud>,
        Arc<FakeLora>,
        Arc<CredentialStore>,
    ) {
        let security = Arc::new(SecurityCore::new(
            vec![0u8; 32],
            SecurityConfig {
                ts_tolerance_s: 300,
                nonce_cache_size: 1000,
                max_failed_attempts: 5,
                lockout_duration_s: 300,
                rate_limit_window_s: 60,
                rate_limit_max_requests: 10,
            },
        ));
        let credentials = Arc::new(CredentialStore::new("/tmp/edge-gateway-router-test"));
        let buffer = Arc::new(ForwardBuffer::new(1000));
        let local = Arc::new(RecordingLocal {
            published: AsyncMutex::new(Vec::new()),
        });
        let cloud = Arc::new(FakeCloud {
            connected: AtomicBool::new(true),
            published: AsyncMutex::new(Vec::new()),
        });
        let lora = Arc::new(FakeLora {
            sent: AsyncMutex::new(Vec::new()),
        });
        let router = Arc::new(EventRouter::new(
            "Gateway1".to_string(),
            security,
            credentials.clone(),
            buffer,
            local.clone() as Arc<dyn LocalPublish>,
            cloud.clone() as Arc<dyn CloudLink>,
            lora.clone() as Arc<dyn LoraSend>,
            "temp_sensor_01".to_string(),
            "fan_01".to_string(),
        ));
        (router, local, cloud, lora, credentials)
    }

    #[tokio::test]
    async fn rfid_scan_grants_known_card_and_publishes_access_log() {
        let (router, _local, cloud, lora, credentials) = build_router();
        credentials
            .apply_snapshot(
                Default::default(),
                {
                    let mut m = std::collections::HashMap::new();
                    m.insert(
                        "a1b2c3d4".to_string(),
                        crate::credentials::RfidCard {
                            uid: "a1b2c3d4".to_string(),
                            active: true,
                            expires_at: None,
                            last_used: None,
                        },
                    );
                    m
                },
                Default::default(),
                "v1".to_string(),
            );

        router.handle_rfid_scan("a1b2c3d4", 1, 23).await;

        let sent = lora.sent.lock().await;
        assert_eq!(sent[0], (1, 23, "GRANT".to_string()));
        let published = cloud.published.lock().await;
        assert_eq!(published[0].0, "gateway/Gateway1/access/rfid_gate_01");
        assert_eq!(published[0].1["result"], json!("granted"));
    }

    #[tokio::test]
    async fn replay_nonce_is_rejected_on_second_request() {
        let (router, local, _cloud, _lora, credentials) = build_router();
        let mut passwords = std::collections::HashMap::new();
        passwords.insert(
            "p1".to_string(),
            crate::credentials::PasswordCredential {
                password_id: "p1".to_string(),
                hash: "a".repeat(64),
                active: true,
                expires_at: None,
                last_used: None,
            },
        );
        credentials.apply_snapshot(passwords, Default::default(), Default::default(), "v1".to_string());

        let ts = chrono::Utc::now().timestamp();
        let body = format!(
            r#"{{"cmd":"unlock_request","pw":"{}","ts":{},"nonce":42}}"#,
            "a".repeat(64),
            ts
        );
        let hmac = router.security.compute_hmac(&body);

        router
            .handle_request(DeviceRequest {
                device_id: "keypad_01".to_string(),
                body: body.clone(),
                hmac: hmac.clone(),
            })
            .await;
        router
            .handle_request(DeviceRequest {
                device_id: "keypad_01".to_string(),
                body,
                hmac,
            })
            .await;

        let published = local.published.lock().await;
        assert_eq!(published[0].1["cmd"], json!("OPEN"));
        assert_eq!(published[1].1["cmd"], json!("LOCK"));
        assert_eq!(published[1].1["reason"], json!("replay_attack"));
    }

    #[tokio::test]
    async fn fan_automation_is_edge_triggered() {
        let (router, local, cloud, _lora, _credentials) = build_router();

        router.handle_telemetry("temp_sensor_01", json!({ "temperature": 29.0 })).await;
        router.handle_telemetry("temp_sensor_01", json!({ "temperature": 29.5 })).await;
        router.handle_telemetry("temp_sensor_01", json!({ "temperature": 30.0 })).await;

        let published = local.published.lock().await;
        let fan_commands: Vec<_> = published
            .iter()
            .filter(|(topic, _)| topic == "home/devices/fan_01/command")
            .collect();
        assert_eq!(fan_commands.len(), 1);
        assert_eq!(fan_commands[0].1["cmd"], json!("fan_on"));
        drop(published);

        let alerts = cloud.published.lock().await;
        let automation_alerts: Vec<_> = alerts
            .iter()
            .filter(|(_, payload)| payload["type"] == json!("automation_trigger"))
            .collect();
        assert_eq!(automation_alerts.len(), 1);
        drop(alerts);

        router.handle_telemetry("temp_sensor_01", json!({ "temperature": 20.0 })).await;
        let published = local.published.lock().await;
        let fan_commands: Vec<_> = published
            .iter()
            .filter(|(topic, _)| topic == "home/devices/fan_01/command")
            .collect();
        assert_eq!(fan_commands.len(), 2);
        assert_eq!(fan_commands[1].1["cmd"], json!("fan_off"));
    }

    #[tokio::test]
    async fn expired_commands_are_swept_after_30_seconds() {
        let (router, _local, cloud, _lora, _credentials) = build_router();
        router
            .pending_commands
            .lock()
            .unwrap()
            .insert(
                "cmd-1".to_string(),
                PendingCommand {
                    command_id: "cmd-1".to_string(),
                    device_id: "fan_01".to_string(),
                    issued_at: Instant::now() - Duration::from_secs(31),
                },
            );
        router.sweep_expired_commands().await;
        assert_eq!(router.pending_command_count(), 0);
        let published = cloud.published.lock().await;
        assert_eq!(published[0].1["status"], json!("expired"));
    }
}
