//! Shared helpers for loader integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use fhb_loader::fhir::{FhirClient, Resource, SubmitResponse};
use fhb_loader::loader::{RecordHandler, ResourceEntry};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fhb_loader=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Write `lines` Patient resources to `dir/name`, one per line
pub fn write_patients(dir: &Path, name: &str, lines: usize) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let stem = name.trim_end_matches(".ndjson").replace('/', "-");
    let body: String = (0..lines)
        .map(|i| format!("{{\"resourceType\":\"Patient\",\"id\":\"{}-{}\"}}\n", stem, i))
        .collect();
    std::fs::write(path, body).unwrap();
}

/// Records every entry it sees, then completes it
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<(String, i64)>>,
    delay: Duration,
}

impl RecordingHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            delay,
        }
    }

    /// (key, line) pairs in completion order
    pub fn seen(&self) -> Vec<(String, i64)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn lines_for(&self, key: &str) -> Vec<i64> {
        let mut lines: Vec<i64> = self
            .seen()
            .into_iter()
            .filter(|(k, _)| k == key)
            .map(|(_, line)| line)
            .collect();
        lines.sort_unstable();
        lines
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle(&self, entry: ResourceEntry) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen
            .lock()
            .unwrap()
            .push((entry.job().key().to_string(), entry.line_number()));
        entry.complete(true, 1).await;
    }
}

/// Accepts everything and echoes the resource's own identity
pub struct AcceptingClient;

#[async_trait]
impl FhirClient for AcceptingClient {
    async fn submit(&self, resource: &Resource) -> anyhow::Result<SubmitResponse> {
        Ok(SubmitResponse {
            status: 201,
            resource_type: resource.resource_type().map(str::to_string),
            logical_id: resource.id().map(str::to_string),
            message: None,
            response_time_ms: 2,
            entries: Vec::new(),
        })
    }
}

pub fn accepting_client() -> Arc<dyn FhirClient> {
    Arc::new(AcceptingClient)
}
