use super::types::DeviceMeta;
use std::collections::HashMap;

#[derive(Debug)]
pub(in crate::ingest) struct IngestState {
    pub(in crate::ingest) device_meta: HashMap<String, DeviceMeta>,
}

impl IngestState {
    pub(in crate::ingest) fn new() -> Self {
        Self {
            device_meta: HashMap::new(),
        }
    }
}
