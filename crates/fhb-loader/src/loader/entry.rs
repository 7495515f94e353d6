//! Records handed downstream and the processor that submits them

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use super::job::BucketJob;
use crate::fhir::{FhirClient, Resource, SubmitResponse};
use crate::ledger::{BundleErrorRecord, JobLedger};

/// One parsed resource on its way downstream
///
/// Completing the entry consumes it. An entry dropped without completing
/// (panic, closed pool) reports a failure so its job can still drain.
pub struct ResourceEntry {
    job: Arc<BucketJob>,
    resource: Resource,
    line_number: i64,
    cost: usize,
    completed: bool,
}

impl ResourceEntry {
    pub fn new(job: Arc<BucketJob>, resource: Resource, line_number: i64, cost: usize) -> Self {
        Self {
            job,
            resource,
            line_number,
            cost,
            completed: false,
        }
    }

    pub fn job(&self) -> &Arc<BucketJob> {
        &self.job
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn line_number(&self) -> i64 {
        self.line_number
    }

    pub fn cost(&self) -> usize {
        self.cost
    }

    pub async fn complete(mut self, success: bool, response_time_ms: i64) {
        self.completed = true;
        self.job.operation_complete(success, response_time_ms).await;
    }
}

impl Drop for ResourceEntry {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        warn!(
            job = %self.job,
            line = self.line_number,
            "Resource entry dropped without completing"
        );
        let job = self.job.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { job.operation_complete(false, 0).await });
            },
            Err(_) => error!(job = %job, "No runtime to report dropped entry; job will not drain"),
        }
    }
}

/// Consumer of parsed records
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Take ownership of an entry; must complete it exactly once
    async fn handle(&self, entry: ResourceEntry);
}

/// Submits records to the FHIR server and records the results in the ledger
pub struct ResourceEntryProcessor {
    client: Arc<dyn FhirClient>,
    ledger: Option<Arc<JobLedger>>,
}

impl ResourceEntryProcessor {
    pub fn new(client: Arc<dyn FhirClient>, ledger: Option<Arc<JobLedger>>) -> Self {
        Self { client, ledger }
    }

    async fn record_success(&self, entry: &ResourceEntry, response: &SubmitResponse) {
        let Some(ledger) = &self.ledger else { return };
        let job = entry.job();

        let mut ids: Vec<(&str, &str)> = response
            .entries
            .iter()
            .filter_map(|e| Some((e.resource_type.as_deref()?, e.logical_id.as_deref()?)))
            .collect();
        if ids.is_empty() {
            if let (Some(t), Some(id)) = (response.resource_type.as_deref(), response.logical_id.as_deref()) {
                ids.push((t, id));
            }
        }

        for (resource_type, logical_id) in ids {
            if let Err(e) = ledger
                .record_logical_id(
                    job.load_id(),
                    entry.line_number(),
                    resource_type,
                    logical_id,
                    response.response_time_ms,
                )
                .await
            {
                warn!(job = %job, line = entry.line_number(), error = %e, "Failed to record logical id");
            }
        }
    }

    async fn record_failures(&self, entry: &ResourceEntry, errors: Vec<BundleErrorRecord>) {
        let Some(ledger) = &self.ledger else { return };
        if let Err(e) = ledger.record_errors(&errors).await {
            warn!(
                job = %entry.job(),
                line = entry.line_number(),
                error = %e,
                "Failed to record submit errors"
            );
        }
    }

    fn error_record(entry: &ResourceEntry, status: Option<u16>, message: String, ms: i64) -> BundleErrorRecord {
        BundleErrorRecord {
            load_id: entry.job().load_id(),
            line_number: entry.line_number(),
            status_code: status.map(i32::from),
            message,
            response_time_ms: ms,
        }
    }
}

#[async_trait]
impl RecordHandler for ResourceEntryProcessor {
    async fn handle(&self, entry: ResourceEntry) {
        let started = Instant::now();

        let response = match self.client.submit(entry.resource()).await {
            Ok(response) => response,
            Err(e) => {
                let ms = started.elapsed().as_millis() as i64;
                warn!(job = %entry.job(), line = entry.line_number(), error = %e, "Submit failed");
                let record = Self::error_record(&entry, None, format!("{:#}", e), ms);
                self.record_failures(&entry, vec![record]).await;
                entry.complete(false, ms).await;
                return;
            },
        };

        let ms = response.response_time_ms;
        let failed_entries: Vec<BundleErrorRecord> = response
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_success())
            .map(|(i, e)| {
                let message = e
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("entry {} returned {}", i, e.status));
                Self::error_record(&entry, Some(e.status), message, ms)
            })
            .collect();

        if response.is_success() {
            self.record_success(&entry, &response).await;
        }

        let success = response.is_success() && failed_entries.is_empty();
        if success {
            debug!(job = %entry.job(), line = entry.line_number(), status = response.status, ms, "Resource stored");
        } else if !response.is_success() {
            warn!(
                job = %entry.job(),
                line = entry.line_number(),
                status = response.status,
                message = response.message.as_deref().unwrap_or(""),
                "Resource rejected"
            );
            let message = response
                .message
                .clone()
                .unwrap_or_else(|| format!("HTTP {}", response.status));
            let mut errors = vec![Self::error_record(&entry, Some(response.status), message, ms)];
            errors.extend(failed_entries);
            self.record_failures(&entry, errors).await;
        } else {
            warn!(
                job = %entry.job(),
                line = entry.line_number(),
                failed = failed_entries.len(),
                "Bundle entries rejected"
            );
            self.record_failures(&entry, failed_entries).await;
        }

        entry.complete(success, ms).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fhir::EntryResponse;
    use crate::ledger::{
        FileType, LeaseTimeouts, MemoryLedgerStore, PathFilter, ScannedObject, LedgerStore,
    };
    use crate::loader::job::JobDoneHandler;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedClient {
        responses: Mutex<Vec<anyhow::Result<SubmitResponse>>>,
    }

    #[async_trait]
    impl FhirClient for ScriptedClient {
        async fn submit(&self, _resource: &Resource) -> anyhow::Result<SubmitResponse> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    #[derive(Default)]
    struct DoneFlag(Mutex<Option<(u64, u64)>>);

    #[async_trait]
    impl JobDoneHandler for DoneFlag {
        async fn on_job_done(&self, job: &BucketJob) {
            *self.0.lock().unwrap() = Some((job.tracker().succeeded(), job.tracker().failed()));
        }
    }

    fn ok(status: u16, t: &str, id: &str) -> SubmitResponse {
        SubmitResponse {
            status,
            resource_type: Some(t.into()),
            logical_id: Some(id.into()),
            message: None,
            response_time_ms: 8,
            entries: Vec::new(),
        }
    }

    async fn ledger_job(store: &Arc<MemoryLedgerStore>) -> (Arc<JobLedger>, Arc<BucketJob>) {
        let ledger = Arc::new(
            JobLedger::register(store.clone(), LeaseTimeouts::default())
                .await
                .unwrap(),
        );
        let path = store.register_bucket_path("b", "").await.unwrap();
        store
            .register_bundles(
                path,
                &[ScannedObject {
                    key: "p.ndjson".into(),
                    size: 1,
                    etag: None,
                    file_type: FileType::Ndjson,
                }],
            )
            .await
            .unwrap();
        let bundle = ledger
            .allocate(FileType::Ndjson, 1, &PathFilter::default())
            .await
            .unwrap()
            .remove(0);
        (ledger, Arc::new(BucketJob::from_allocation(bundle)))
    }

    fn patient() -> Resource {
        Resource::from_value(json!({"resourceType": "Patient", "id": "p1"})).unwrap()
    }

    #[tokio::test]
    async fn test_outcomes_are_recorded_per_line() {
        let store = Arc::new(MemoryLedgerStore::new());
        let (ledger, job) = ledger_job(&store).await;
        let done = Arc::new(DoneFlag::default());
        job.set_done_handler(done.clone());

        let mut rejected = ok(422, "Patient", "p2");
        rejected.message = Some("bad birthDate".into());
        let client = Arc::new(ScriptedClient {
            responses: Mutex::new(vec![Ok(ok(201, "Patient", "p1")), Ok(rejected), Err(anyhow!("connection reset"))]),
        });
        let processor = ResourceEntryProcessor::new(client, Some(ledger));

        for line in 0..3 {
            job.record_submitted(0);
            processor
                .handle(ResourceEntry::new(job.clone(), patient(), line, 1))
                .await;
        }
        job.file_processing_complete().await;

        assert_eq!(*done.0.lock().unwrap(), Some((1, 2)));

        let ids = store.logical_ids();
        assert_eq!(ids.len(), 1);
        assert_eq!((ids[0].line_number, ids[0].logical_id.as_str()), (0, "p1"));

        let errors = store.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].line_number, 1);
        assert_eq!(errors[0].status_code, Some(422));
        assert_eq!(errors[0].message, "bad birthDate");
        assert_eq!(errors[1].status_code, None);
        assert!(errors[1].message.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_partially_failed_batch_counts_as_failure() {
        let store = Arc::new(MemoryLedgerStore::new());
        let (ledger, job) = ledger_job(&store).await;

        let mut response = ok(200, "Bundle", "b1");
        response.entries = vec![
            EntryResponse {
                status: 201,
                resource_type: Some("Patient".into()),
                logical_id: Some("p1".into()),
                message: None,
            },
            EntryResponse {
                status: 400,
                resource_type: None,
                logical_id: None,
                message: None,
            },
        ];
        let client = Arc::new(ScriptedClient {
            responses: Mutex::new(vec![Ok(response)]),
        });
        let processor = ResourceEntryProcessor::new(client, Some(ledger));

        job.record_submitted(2);
        processor
            .handle(ResourceEntry::new(job.clone(), patient(), 0, 1))
            .await;

        assert_eq!(job.tracker().failed(), 1);
        assert_eq!(store.logical_ids().len(), 1);
        assert_eq!(store.errors()[0].message, "entry 1 returned 400");
    }

    #[tokio::test]
    async fn test_dropped_entry_reports_failure() {
        let job = Arc::new(BucketJob::local("x.ndjson", FileType::Ndjson, 1));
        let done = Arc::new(DoneFlag::default());
        job.set_done_handler(done.clone());

        job.record_submitted(0);
        drop(ResourceEntry::new(job.clone(), patient(), 0, 1));
        job.file_processing_complete().await;

        for _ in 0..100 {
            if job.is_done() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*done.0.lock().unwrap(), Some((0, 1)));
    }
}
