//! In-process ledger store
//!
//! Implements the [`LedgerStore`] contract behind one mutex, so every call is
//! trivially atomic. Used for tests and single-process dry runs. Time comes
//! from the wall clock plus an adjustable offset so liveness rules can be
//! exercised without sleeping.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::types::{
    AllocatedBundle, BundleErrorRecord, BundleStatus, FileType, LeaseTimeouts, LoadOutcome,
    LoaderInstance, LogicalIdRecord, PathFilter, RegisterSummary, ScannedObject,
};
use super::LedgerStore;

const SEED_RESOURCE_TYPES: &[&str] = &[
    "AllergyIntolerance",
    "Bundle",
    "CarePlan",
    "Condition",
    "DiagnosticReport",
    "Encounter",
    "Immunization",
    "MedicationRequest",
    "Observation",
    "Organization",
    "Patient",
    "Practitioner",
    "Procedure",
];

#[derive(Debug, Clone)]
struct InstanceRow {
    heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct BundleRow {
    bucket_path_id: i64,
    object_name: String,
    object_size: i64,
    file_type: FileType,
    etag: Option<String>,
    version: i32,
    status: BundleStatus,
    owner: Option<i64>,
    allocated_at: Option<DateTime<Utc>>,
}

/// Snapshot of a load row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRow {
    pub load_id: i64,
    pub resource_bundle_id: i64,
    pub loader_instance_id: i64,
    pub version: i32,
    pub completed: bool,
    pub row_count: Option<i64>,
    pub failure_count: Option<i64>,
}

#[derive(Default)]
struct State {
    clock_offset: ChronoDuration,
    next_id: i64,
    instances: BTreeMap<i64, InstanceRow>,
    bucket_paths: BTreeMap<i64, (String, String)>,
    bundles: BTreeMap<i64, BundleRow>,
    loads: BTreeMap<i64, LoadRow>,
    logical_ids: Vec<LogicalIdRecord>,
    errors: Vec<BundleErrorRecord>,
    resource_types: HashMap<String, i32>,
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn clear_stale(&mut self, timeouts: &LeaseTimeouts) -> u64 {
        let now = self.now();
        let heartbeat_cutoff = now - to_chrono(timeouts.heartbeat_timeout);
        let recycle_cutoff = now - to_chrono(timeouts.recycle_after);

        let mut cleared = 0;
        for bundle in self.bundles.values_mut() {
            if bundle.status != BundleStatus::Claimed {
                continue;
            }
            let owner_stale = bundle
                .owner
                .and_then(|id| self.instances.get(&id))
                .map(|i| i.heartbeat_at < heartbeat_cutoff)
                .unwrap_or(true);
            let lease_old = bundle
                .allocated_at
                .map(|t| t < recycle_cutoff)
                .unwrap_or(true);

            if owner_stale && lease_old {
                bundle.status = BundleStatus::Ready;
                bundle.owner = None;
                bundle.allocated_at = None;
                cleared += 1;
            }
        }
        cleared
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

/// Ledger store held entirely in memory
pub struct MemoryLedgerStore {
    state: Mutex<State>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        let mut state = State::default();
        for (i, name) in SEED_RESOURCE_TYPES.iter().enumerate() {
            state.resource_types.insert(name.to_string(), i as i32 + 1);
        }
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("Memory ledger state poisoned"))
    }

    /// Move the store's clock forward
    pub fn advance(&self, by: Duration) {
        if let Ok(mut state) = self.lock() {
            state.clock_offset = state.clock_offset + to_chrono(by);
        }
    }

    /// Status and owner of a bundle row
    pub fn bundle_status(&self, resource_bundle_id: i64) -> Option<(BundleStatus, Option<i64>)> {
        let state = self.lock().ok()?;
        state
            .bundles
            .get(&resource_bundle_id)
            .map(|b| (b.status, b.owner))
    }

    pub fn version_of(&self, resource_bundle_id: i64) -> Option<i32> {
        let state = self.lock().ok()?;
        state.bundles.get(&resource_bundle_id).map(|b| b.version)
    }

    pub fn loads(&self) -> Vec<LoadRow> {
        self.lock()
            .map(|s| s.loads.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn logical_ids(&self) -> Vec<LogicalIdRecord> {
        self.lock()
            .map(|s| s.logical_ids.clone())
            .unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<BundleErrorRecord> {
        self.lock().map(|s| s.errors.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn register_instance(&self, _instance: &LoaderInstance) -> Result<i64> {
        let mut state = self.lock()?;
        let id = state.next_id();
        let heartbeat_at = state.now();
        state.instances.insert(id, InstanceRow { heartbeat_at });
        Ok(id)
    }

    async fn heartbeat(&self, instance_id: i64) -> Result<()> {
        let mut state = self.lock()?;
        let now = state.now();
        let row = state
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| anyhow!("Unknown loader instance {}", instance_id))?;
        row.heartbeat_at = now;
        Ok(())
    }

    async fn clear_stale_allocations(&self, timeouts: &LeaseTimeouts) -> Result<u64> {
        Ok(self.lock()?.clear_stale(timeouts))
    }

    async fn allocate_jobs(
        &self,
        instance_id: i64,
        file_type: FileType,
        max: usize,
        filter: &PathFilter,
        timeouts: &LeaseTimeouts,
    ) -> Result<Vec<AllocatedBundle>> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        if !state.instances.contains_key(&instance_id) {
            return Err(anyhow!("Unknown loader instance {}", instance_id));
        }

        state.clear_stale(timeouts);

        let candidates: Vec<i64> = state
            .bundles
            .iter()
            .filter(|(_, b)| {
                b.status == BundleStatus::Ready
                    && b.file_type == file_type
                    && filter.matches(&b.object_name)
            })
            .map(|(id, _)| *id)
            .take(max)
            .collect();

        let now = state.now();
        let mut allocated = Vec::with_capacity(candidates.len());

        for resource_bundle_id in candidates {
            let load_id = state.next_id();
            let Some(bundle) = state.bundles.get_mut(&resource_bundle_id) else {
                continue;
            };
            bundle.status = BundleStatus::Claimed;
            bundle.owner = Some(instance_id);
            bundle.allocated_at = Some(now);

            let version = bundle.version;
            let key = bundle.object_name.clone();
            let size = bundle.object_size;
            let bucket = state
                .bucket_paths
                .get(&bundle.bucket_path_id)
                .map(|(bucket, _)| bucket.clone())
                .unwrap_or_default();

            state.loads.insert(
                load_id,
                LoadRow {
                    load_id,
                    resource_bundle_id,
                    loader_instance_id: instance_id,
                    version,
                    completed: false,
                    row_count: None,
                    failure_count: None,
                },
            );

            allocated.push(AllocatedBundle {
                resource_bundle_id,
                load_id,
                bucket,
                key,
                file_type,
                version,
                size,
            });
        }

        Ok(allocated)
    }

    async fn mark_done(&self, instance_id: i64, outcome: &LoadOutcome) -> Result<()> {
        let mut state = self.lock()?;

        let load = state
            .loads
            .get_mut(&outcome.load_id)
            .ok_or_else(|| anyhow!("Unknown bundle load {}", outcome.load_id))?;
        load.completed = true;
        load.row_count = Some(outcome.row_count);
        load.failure_count = Some(outcome.failure_count);

        if let Some(bundle) = state.bundles.get_mut(&outcome.resource_bundle_id) {
            if bundle.status == BundleStatus::Claimed && bundle.owner == Some(instance_id) {
                bundle.status = BundleStatus::Done;
            }
        }
        Ok(())
    }

    async fn record_logical_ids(&self, records: &[LogicalIdRecord]) -> Result<()> {
        self.lock()?.logical_ids.extend_from_slice(records);
        Ok(())
    }

    async fn record_errors(&self, records: &[BundleErrorRecord]) -> Result<()> {
        self.lock()?.errors.extend_from_slice(records);
        Ok(())
    }

    async fn last_processed_line(
        &self,
        resource_bundle_id: i64,
        version: i32,
        current_load_id: i64,
    ) -> Result<Option<i64>> {
        let state = self.lock()?;
        let earlier_loads: Vec<i64> = state
            .loads
            .values()
            .filter(|l| {
                l.resource_bundle_id == resource_bundle_id
                    && l.version == version
                    && l.load_id != current_load_id
            })
            .map(|l| l.load_id)
            .collect();

        let from_ids = state
            .logical_ids
            .iter()
            .filter(|r| earlier_loads.contains(&r.load_id))
            .map(|r| r.line_number);
        let from_errors = state
            .errors
            .iter()
            .filter(|r| earlier_loads.contains(&r.load_id))
            .map(|r| r.line_number);

        Ok(from_ids.chain(from_errors).max())
    }

    async fn resource_types(&self) -> Result<HashMap<String, i32>> {
        Ok(self.lock()?.resource_types.clone())
    }

    async fn ensure_resource_type(&self, name: &str) -> Result<i32> {
        let mut state = self.lock()?;
        let next = state.resource_types.len() as i32 + 1;
        Ok(*state.resource_types.entry(name.to_string()).or_insert(next))
    }

    async fn register_bucket_path(&self, bucket: &str, path: &str) -> Result<i64> {
        let mut state = self.lock()?;
        if let Some((id, _)) = state
            .bucket_paths
            .iter()
            .find(|(_, (b, p))| b == bucket && p == path)
        {
            return Ok(*id);
        }
        let id = state.next_id();
        state
            .bucket_paths
            .insert(id, (bucket.to_string(), path.to_string()));
        Ok(id)
    }

    async fn register_bundles(
        &self,
        bucket_path_id: i64,
        objects: &[ScannedObject],
    ) -> Result<RegisterSummary> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        if !state.bucket_paths.contains_key(&bucket_path_id) {
            return Err(anyhow!("Unknown bucket path {}", bucket_path_id));
        }

        let mut summary = RegisterSummary::default();
        for object in objects {
            let existing = state
                .bundles
                .iter_mut()
                .find(|(_, b)| b.bucket_path_id == bucket_path_id && b.object_name == object.key);

            match existing {
                Some((_, bundle)) if bundle.etag != object.etag => {
                    bundle.etag = object.etag.clone();
                    bundle.object_size = object.size;
                    bundle.version += 1;
                    bundle.status = BundleStatus::Ready;
                    bundle.owner = None;
                    bundle.allocated_at = None;
                    summary.changed += 1;
                },
                Some(_) => summary.unchanged += 1,
                None => {
                    let id = state.next_id();
                    state.bundles.insert(
                        id,
                        BundleRow {
                            bucket_path_id,
                            object_name: object.key.clone(),
                            object_size: object.size,
                            file_type: object.file_type,
                            etag: object.etag.clone(),
                            version: 1,
                            status: BundleStatus::Ready,
                            owner: None,
                            allocated_at: None,
                        },
                    );
                    summary.inserted += 1;
                },
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn object(key: &str, etag: &str) -> ScannedObject {
        ScannedObject {
            key: key.to_string(),
            size: 10,
            etag: Some(etag.to_string()),
            file_type: FileType::from_key(key).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_register_bundles_versions_changed_objects() {
        let store = MemoryLedgerStore::new();
        let path = store.register_bucket_path("bucket", "run1").await.unwrap();
        assert_eq!(store.register_bucket_path("bucket", "run1").await.unwrap(), path);

        let first = store
            .register_bundles(path, &[object("run1/a.ndjson", "e1"), object("run1/b.json", "e1")])
            .await
            .unwrap();
        assert_eq!(first.inserted, 2);

        let second = store
            .register_bundles(path, &[object("run1/a.ndjson", "e2"), object("run1/b.json", "e1")])
            .await
            .unwrap();
        assert_eq!(second, RegisterSummary { inserted: 0, changed: 1, unchanged: 1 });
    }

    #[tokio::test]
    async fn test_allocate_respects_type_filter_and_limit() {
        let store = MemoryLedgerStore::new();
        let instance = store.register_instance(&LoaderInstance::local()).await.unwrap();
        let path = store.register_bucket_path("bucket", "").await.unwrap();
        store
            .register_bundles(
                path,
                &[
                    object("a/1.ndjson", "x"),
                    object("a/2.ndjson", "x"),
                    object("b/3.ndjson", "x"),
                    object("a/4.json", "x"),
                ],
            )
            .await
            .unwrap();

        let timeouts = LeaseTimeouts::default();
        let filter = PathFilter::new(["a/"]);
        let jobs = store
            .allocate_jobs(instance, FileType::Ndjson, 5, &filter, &timeouts)
            .await
            .unwrap();
        let keys: Vec<_> = jobs.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(keys, vec!["a/1.ndjson", "a/2.ndjson"]);
        assert!(jobs.iter().all(|j| j.bucket == "bucket" && j.version == 1));

        let again = store
            .allocate_jobs(instance, FileType::Ndjson, 5, &filter, &timeouts)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_mark_done_requires_ownership() {
        let store = MemoryLedgerStore::new();
        let owner = store.register_instance(&LoaderInstance::local()).await.unwrap();
        let other = store.register_instance(&LoaderInstance::local()).await.unwrap();
        let path = store.register_bucket_path("bucket", "").await.unwrap();
        store
            .register_bundles(path, &[object("x.ndjson", "1")])
            .await
            .unwrap();

        let jobs = store
            .allocate_jobs(owner, FileType::Ndjson, 1, &PathFilter::default(), &LeaseTimeouts::default())
            .await
            .unwrap();
        let outcome = LoadOutcome {
            resource_bundle_id: jobs[0].resource_bundle_id,
            load_id: jobs[0].load_id,
            row_count: 4,
            failure_count: 1,
        };

        store.mark_done(other, &outcome).await.unwrap();
        assert_eq!(
            store.bundle_status(outcome.resource_bundle_id),
            Some((BundleStatus::Claimed, Some(owner)))
        );

        store.mark_done(owner, &outcome).await.unwrap();
        assert_eq!(
            store.bundle_status(outcome.resource_bundle_id).map(|s| s.0),
            Some(BundleStatus::Done)
        );
        let load = &store.loads()[0];
        assert!(load.completed);
        assert_eq!(load.failure_count, Some(1));
    }
}
