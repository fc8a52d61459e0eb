//! Credential store (C3): in-memory mapping of passwords, RFID UIDs and
//! devices, backed by atomic tmp+rename JSON persistence with a single
//! generation of backup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordCredential {
    pub password_id: String,
    pub hash: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfidCard {
    pub uid: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_type: String,
    pub status: String,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub rule_name: String,
    pub enabled: bool,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub allowed_methods: Vec<String>,
    pub restricted_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub auto_fan_enabled: bool,
    pub temp_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub automation: Automation,
    pub access_rules: Vec<AccessRule>,
    #[serde(default)]
    pub home_occupied: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            automation: Automation {
                auto_fan_enabled: true,
                temp_threshold: 28.0,
            },
            access_rules: Vec::new(),
            home_occupied: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Devices {
    passwords: HashMap<String, PasswordCredential>,
    rfid_cards: HashMap<String, RfidCard>,
    devices: HashMap<String, DeviceRecord>,
}

struct Inner {
    devices: Devices,
    settings: Settings,
    database_version: Option<String>,
}

pub struct CredentialStore {
    data_dir: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Rfid,
    Passkey,
    RemoteControl,
}

impl AuthMethod {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Rfid => "rfid",
            Self::Passkey => "passkey",
            Self::RemoteControl => "remote_control",
        }
    }
}

impl CredentialStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            inner: Mutex::new(Inner {
                devices: Devices::default(),
                settings: Settings::default(),
                database_version: None,
            }),
        }
    }

    fn devices_path(&self) -> PathBuf {
        self.data_dir.join("devices.json")
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    /// Loads persisted state, falling back to the `.backup` generation if the
    /// primary file is missing or corrupt.
    pub async fn load(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).await.ok();
        let devices = load_json_with_backup::<Devices>(&self.devices_path())
            .await
            .unwrap_or_default();
        let settings = load_json_with_backup::<Settings>(&self.settings_path())
            .await
            .unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        inner.devices = devices;
        inner.settings = settings;
        Ok(())
    }

    pub async fn persist(&self) -> Result<()> {
        let (devices, settings) = {
            let inner = self.inner.lock().unwrap();
            (inner.devices.clone(), inner.settings.clone())
        };
        atomic_write_json(&self.devices_path(), &devices).await?;
        atomic_write_json(&self.settings_path(), &settings).await?;
        Ok(())
    }

    pub fn lookup_password(&self, password_hash: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        inner
            .devices
            .passwords
            .values()
            .find(|cred| {
                cred.hash == password_hash
                    && cred.active
                    && cred.expires_at.map(|exp| exp > now).unwrap_or(true)
            })
            .map(|cred| cred.password_id.clone())
    }

    pub fn lookup_rfid(&self, uid: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        inner
            .devices
            .rfid_cards
            .get(uid)
            .map(|card| card.active && card.expires_at.map(|exp| exp > now).unwrap_or(true))
            .unwrap_or(false)
    }

    pub fn mark_password_used(&self, password_id: &str, when: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cred) = inner.devices.passwords.get_mut(password_id) {
            cred.last_used = Some(when);
        }
    }

    pub fn mark_rfid_used(&self, uid: &str, when: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(card) = inner.devices.rfid_cards.get_mut(uid) {
            card.last_used = Some(when);
        }
    }

    pub fn upsert_device(&self, device: DeviceRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.devices.devices.insert(device.device_id.clone(), device);
    }

    pub fn home_occupied(&self) -> bool {
        self.inner.lock().unwrap().settings.home_occupied
    }

    pub fn set_home_occupied(&self, occupied: bool) {
        self.inner.lock().unwrap().settings.home_occupied = occupied;
    }

    pub fn automation(&self) -> Automation {
        self.inner.lock().unwrap().settings.automation.clone()
    }

    pub fn database_version(&self) -> Option<String> {
        self.inner.lock().unwrap().database_version.clone()
    }

    /// Replaces the credential snapshot atomically, preserving any locally
    /// recorded `last_used` timestamps that are newer than the incoming ones
    /// (testable property 7).
    pub fn apply_snapshot(
        &self,
        passwords: HashMap<String, PasswordCredential>,
        rfid_cards: HashMap<String, RfidCard>,
        devices: HashMap<String, DeviceRecord>,
        version: String,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let mut passwords = passwords;
        for (id, existing) in inner.devices.passwords.iter() {
            if let Some(incoming) = passwords.get_mut(id) {
                if newer(existing.last_used, incoming.last_used) {
                    incoming.last_used = existing.last_used;
                }
            }
        }
        let mut rfid_cards = rfid_cards;
        for (uid, existing) in inner.devices.rfid_cards.iter() {
            if let Some(incoming) = rfid_cards.get_mut(uid) {
                if newer(existing.last_used, incoming.last_used) {
                    incoming.last_used = existing.last_used;
                }
            }
        }
        inner.devices.passwords = passwords;
        inner.devices.rfid_cards = rfid_cards;
        inner.devices.devices = devices;
        inner.database_version = Some(version);
    }

    /// Evaluates the enabled access rules against the current local time.
    /// Returns `(true, None)` on allow, `(false, Some(reason))` on deny. No
    /// matching rule defaults to allow; any unexpected error fails open.
    pub fn check_access(&self, method: AuthMethod, user_id: &str, now: NaiveTime) -> (bool, Option<String>) {
        let inner = self.inner.lock().unwrap();
        for rule in inner.settings.access_rules.iter().filter(|r| r.enabled) {
            if !time_in_window(now, rule.start_time, rule.end_time) {
                continue;
            }
            if !rule.allowed_methods.iter().any(|m| m == method.as_str()) {
                return (false, Some(format!("method_not_allowed_{}", rule.rule_name)));
            }
            if rule.restricted_users.iter().any(|u| u == user_id) {
                return (false, Some(format!("user_restricted_{}", rule.rule_name)));
            }
            return (true, None);
        }
        (true, None)
    }
}

fn newer(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Time window containment with midnight wrap: if `start > end`, the window
/// spans midnight and `now` is inside when it is >= start OR < end.
fn time_in_window(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

async fn load_json_with_backup<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    if let Ok(contents) = fs::read_to_string(path).await {
        if let Ok(value) = serde_json::from_str(&contents) {
            return Ok(value);
        }
    }
    let backup = backup_path(path);
    if let Ok(contents) = fs::read_to_string(&backup).await {
        if let Ok(value) = serde_json::from_str(&contents) {
            return Ok(value);
        }
    }
    Ok(T::default())
}

fn backup_path(path: &Path) -> PathBuf {
    let mut backup = path.to_path_buf();
    backup.set_extension(format!(
        "{}.backup",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json")
    ));
    backup
}

/// Atomic save: write to `name.tmp`, rename the prior target to `name.backup`
/// (keeping exactly one generation), then rename `name.tmp` over the target.
async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let pretty = serde_json::to_string_pretty(value).context("serialize credential snapshot")?;
    fs::write(&tmp_path, pretty.as_bytes())
        .await
        .with_context(|| format!("write {}", tmp_path.display()))?;

    if fs::metadata(path).await.is_ok() {
        let backup = backup_path(path);
        fs::rename(path, &backup)
            .await
            .with_context(|| format!("rotate backup for {}", path.display()))?;
    }

    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("commit {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn persists_and_reloads_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.load().await.unwrap();

        let mut passwords = HashMap::new();
        passwords.insert(
            "p1".to_string(),
            PasswordCredential {
                password_id: "p1".to_string(),
                hash: "a".repeat(64),
                active: true,
                expires_at: None,
                last_used: None,
            },
        );
        store.apply_snapshot(passwords, HashMap::new(), HashMap::new(), "abc123".to_string());
        store.persist().await.unwrap();

        let reloaded = CredentialStore::new(dir.path());
        reloaded.load().await.unwrap();
        assert!(reloaded.lookup_password(&"a".repeat(64)).is_some());
    }

    #[test]
    fn midnight_wrap_window_contains_late_and_early_hours() {
        let start = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        assert!(time_in_window(NaiveTime::from_hms_opt(23, 30, 0).unwrap(), start, end));
        assert!(time_in_window(NaiveTime::from_hms_opt(2, 0, 0).unwrap(), start, end));
        assert!(!time_in_window(NaiveTime::from_hms_opt(12, 0, 0).unwrap(), start, end));
    }

    #[test]
    fn snapshot_apply_preserves_newer_local_last_used() {
        let store = CredentialStore::new("/tmp/unused-credentials-test");
        let now = Utc::now();
        let mut passwords = HashMap::new();
        passwords.insert(
            "p1".to_string(),
            PasswordCredential {
                password_id: "p1".to_string(),
                hash: "a".repeat(64),
                active: true,
                expires_at: None,
                last_used: Some(now),
            },
        );
        store.apply_snapshot(passwords.clone(), HashMap::new(), HashMap::new(), "v1".to_string());

        let mut incoming = passwords.clone();
        incoming.get_mut("p1").unwrap().last_used = Some(now - Duration::hours(1));
        store.apply_snapshot(incoming, HashMap::new(), HashMap::new(), "v2".to_string());

        let inner = store.inner.lock().unwrap();
        assert_eq!(inner.devices.passwords["p1"].last_used, Some(now));
    }
}
