use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Cached join result for a (gateway_id, device_id) pair, avoiding a DB
/// round-trip on every telemetry/access sample.
#[derive(Clone, Debug)]
pub(in crate::ingest) struct DeviceMeta {
    pub(in crate::ingest) device_id: String,
    pub(in crate::ingest) gateway_id: String,
    pub(in crate::ingest) user_id: Uuid,
}

#[derive(Clone, Debug)]
pub struct TelemetryRow {
    pub time: DateTime<Utc>,
    pub device_id: String,
    pub gateway_id: String,
    pub user_id: Uuid,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub metadata: serde_json::Value,
}
