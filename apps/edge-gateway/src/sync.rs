//! Sync client (C4): polls the cloud for a credential snapshot keyed by a
//! content hash, applying updates atomically into the credential store.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::credentials::{CredentialStore, DeviceRecord, PasswordCredential, RfidCard};

#[derive(Debug, Deserialize)]
struct DatabaseSnapshot {
    passwords: std::collections::HashMap<String, PasswordCredential>,
    rfid_cards: std::collections::HashMap<String, RfidCard>,
    devices: std::collections::HashMap<String, DeviceRecord>,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    needs_update: bool,
    version: String,
    #[serde(default)]
    database: Option<DatabaseSnapshot>,
}

pub struct SyncClient {
    gateway_id: String,
    base_url: String,
    interval: Duration,
    store: Arc<CredentialStore>,
    http: reqwest_like::Client,
}

/// Minimal HTTP client seam so the sync loop can be unit tested without a
/// live server; the production binary wires this to a real client.
pub mod reqwest_like {
    use async_trait::async_trait;

    #[async_trait]
    pub trait HttpGet: Send + Sync {
        async fn get_sync(
            &self,
            url: &str,
            version_header: &str,
        ) -> anyhow::Result<String>;
    }

    #[derive(Clone)]
    pub struct Client(std::sync::Arc<dyn HttpGet>);

    impl Client {
        pub fn new(inner: std::sync::Arc<dyn HttpGet>) -> Self {
            Self(inner)
        }

        pub async fn get_sync(&self, url: &str, version_header: &str) -> anyhow::Result<String> {
            self.0.get_sync(url, version_header).await
        }
    }

    /// Production client backed by `reqwest`.
    pub struct ReqwestHttp(pub reqwest::Client);

    #[async_trait]
    impl HttpGet for ReqwestHttp {
        async fn get_sync(&self, url: &str, version_header: &str) -> anyhow::Result<String> {
            let resp = self
                .0
                .get(url)
                .header("X-DB-Version", version_header)
                .send()
                .await?;
            Ok(resp.text().await?)
        }
    }
}

impl SyncClient {
    pub fn new(
        gateway_id: String,
        base_url: String,
        interval: Duration,
        store: Arc<CredentialStore>,
        http: reqwest_like::Client,
    ) -> Self {
        Self {
            gateway_id,
            base_url,
            interval,
            store,
            http,
        }
    }

    /// Starts the periodic+triggered poll loop. `trigger_rx` carries external
    /// wakeups from `gateway/{id}/sync/trigger` MQTT messages.
    pub fn start(
        self: Arc<Self>,
        mut trigger_rx: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = trigger_rx.recv() => {}
                }
                if let Err(err) = self.tick().await {
                    warn!(error = %err, "sync tick failed");
                }
            }
            info!("sync client stopped");
        })
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let version = self.store.database_version().unwrap_or_default();
        let url = format!("{}/api/sync/database/{}", self.base_url, self.gateway_id);
        let body = self.http.get_sync(&url, &version).await?;
        let response: SyncResponse = match serde_json::from_str(&body) {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "malformed sync response body");
                return Ok(());
            }
        };

        if !response.needs_update {
            return Ok(());
        }

        let Some(database) = response.database else {
            warn!("sync response claimed needs_update but carried no database payload");
            return Ok(());
        };

        self.store.apply_snapshot(
            database.passwords,
            database.rfid_cards,
            database.devices,
            response.version,
        );
        self.store.persist().await?;
        info!("sync_applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHttp {
        body: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl reqwest_like::HttpGet for FakeHttp {
        async fn get_sync(&self, _url: &str, _version: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.clone())
        }
    }

    #[tokio::test]
    async fn no_update_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path()));
        store.load().await.unwrap();

        let fake = Arc::new(FakeHttp {
            body: r#"{"needs_update":false,"version":"abc"}"#.to_string(),
            calls: AtomicUsize::new(0),
        });
        let client = SyncClient::new(
            "gw1".to_string(),
            "https://cloud.example.com".to_string(),
            Duration::from_secs(5),
            store.clone(),
            reqwest_like::Client::new(fake),
        );
        client.tick().await.unwrap();
        assert!(store.database_version().is_none());
    }
}
