//! Shared job ledger
//!
//! The ledger is the only state shared between loader instances. Every
//! mutation goes through a [`LedgerStore`] method, and each method is one
//! transaction: it either applies completely or fails and leaves nothing
//! behind.
//!
//! [`JobLedger`] is the per-process session over a store. It is created once
//! at startup by registering the instance and is handed to every component
//! that needs ledger access.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod memory;
pub mod postgres;
pub mod types;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;
pub use types::{
    AllocatedBundle, BundleErrorRecord, BundleStatus, FileType, LeaseTimeouts, LoadOutcome,
    LoaderInstance, LogicalIdRecord, PathFilter, RegisterSummary, ScannedObject, NO_LEDGER_ID,
};

/// Persistence commands behind the ledger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a loader instance row and return its id
    async fn register_instance(&self, instance: &LoaderInstance) -> Result<i64>;

    /// Refresh the instance's last-seen timestamp
    async fn heartbeat(&self, instance_id: i64) -> Result<()>;

    /// Return stale leases to the ready pool; returns the number reclaimed
    async fn clear_stale_allocations(&self, timeouts: &LeaseTimeouts) -> Result<u64>;

    /// Reclaim stale leases, then claim up to `max` ready bundles
    async fn allocate_jobs(
        &self,
        instance_id: i64,
        file_type: FileType,
        max: usize,
        filter: &PathFilter,
        timeouts: &LeaseTimeouts,
    ) -> Result<Vec<AllocatedBundle>>;

    /// Close the load row and mark the bundle done if this instance still owns it
    async fn mark_done(&self, instance_id: i64, outcome: &LoadOutcome) -> Result<()>;

    async fn record_logical_ids(&self, records: &[LogicalIdRecord]) -> Result<()>;

    async fn record_errors(&self, records: &[BundleErrorRecord]) -> Result<()>;

    /// Highest line recorded by an earlier load of the same bundle version
    async fn last_processed_line(
        &self,
        resource_bundle_id: i64,
        version: i32,
        current_load_id: i64,
    ) -> Result<Option<i64>>;

    /// Resource type name -> id
    async fn resource_types(&self) -> Result<HashMap<String, i32>>;

    /// Id for a resource type, inserting it if unknown
    async fn ensure_resource_type(&self, name: &str) -> Result<i32>;

    async fn register_bucket_path(&self, bucket: &str, path: &str) -> Result<i64>;

    /// Upsert scanned objects under a bucket path
    ///
    /// New objects become ready. An object whose etag changed gets its
    /// version bumped and becomes ready again. Anything else is untouched.
    async fn register_bundles(
        &self,
        bucket_path_id: i64,
        objects: &[ScannedObject],
    ) -> Result<RegisterSummary>;
}

/// Ledger session for one loader instance
pub struct JobLedger {
    store: Arc<dyn LedgerStore>,
    instance: LoaderInstance,
    timeouts: LeaseTimeouts,
    resource_types: HashMap<String, i32>,
}

impl JobLedger {
    /// Register this process with the ledger and load the resource type cache
    ///
    /// Failure here means the loader cannot take part in allocation at all.
    pub async fn register(store: Arc<dyn LedgerStore>, timeouts: LeaseTimeouts) -> Result<Self> {
        let mut instance = LoaderInstance::local();
        instance.id = store
            .register_instance(&instance)
            .await
            .context("Failed to register loader instance")?;

        let resource_types = store
            .resource_types()
            .await
            .context("Failed to load resource types")?;

        info!(
            loader_instance_id = instance.id,
            loader_instance_key = %instance.key,
            hostname = %instance.hostname,
            resource_types = resource_types.len(),
            "Registered loader instance"
        );

        Ok(Self {
            store,
            instance,
            timeouts,
            resource_types,
        })
    }

    pub fn instance(&self) -> &LoaderInstance {
        &self.instance
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.store.heartbeat(self.instance.id).await
    }

    pub async fn clear_stale(&self) -> Result<u64> {
        let cleared = self.store.clear_stale_allocations(&self.timeouts).await?;
        if cleared > 0 {
            info!(cleared, "Reclaimed stale bundle allocations");
        }
        Ok(cleared)
    }

    /// Claim up to `free_slots` bundles of one content type
    pub async fn allocate(
        &self,
        file_type: FileType,
        free_slots: usize,
        filter: &PathFilter,
    ) -> Result<Vec<AllocatedBundle>> {
        if free_slots == 0 {
            return Ok(Vec::new());
        }

        let allocated = self
            .store
            .allocate_jobs(self.instance.id, file_type, free_slots, filter, &self.timeouts)
            .await
            .with_context(|| format!("Failed to allocate {} jobs", file_type))?;

        debug!(
            file_type = %file_type,
            requested = free_slots,
            allocated = allocated.len(),
            "Allocation complete"
        );

        Ok(allocated)
    }

    /// Record final counts; no-op for jobs outside the ledger
    pub async fn mark_done(&self, outcome: &LoadOutcome) -> Result<()> {
        if outcome.load_id == NO_LEDGER_ID {
            return Ok(());
        }
        self.store.mark_done(self.instance.id, outcome).await
    }

    pub async fn record_logical_id(
        &self,
        load_id: i64,
        line_number: i64,
        resource_type: &str,
        logical_id: &str,
        response_time_ms: i64,
    ) -> Result<()> {
        if load_id == NO_LEDGER_ID {
            return Ok(());
        }

        let resource_type_id = self.resource_type_id(resource_type).await?;
        self.store
            .record_logical_ids(&[LogicalIdRecord {
                load_id,
                line_number,
                resource_type_id,
                logical_id: logical_id.to_string(),
                response_time_ms,
            }])
            .await
    }

    pub async fn record_errors(&self, errors: &[BundleErrorRecord]) -> Result<()> {
        let errors: Vec<_> = errors
            .iter()
            .filter(|e| e.load_id != NO_LEDGER_ID)
            .cloned()
            .collect();
        if errors.is_empty() {
            return Ok(());
        }
        self.store.record_errors(&errors).await
    }

    /// Resume point for a bundle load, or `None` if nothing was recorded before
    pub async fn last_processed_line(
        &self,
        resource_bundle_id: i64,
        version: i32,
        load_id: i64,
    ) -> Result<Option<i64>> {
        if resource_bundle_id == NO_LEDGER_ID {
            return Ok(None);
        }
        self.store
            .last_processed_line(resource_bundle_id, version, load_id)
            .await
    }

    async fn resource_type_id(&self, name: &str) -> Result<i32> {
        match self.resource_types.get(name) {
            Some(id) => Ok(*id),
            None => {
                // The cache is fixed after startup; new types go straight to the store.
                warn!(resource_type = name, "Resource type missing from cache");
                self.store.ensure_resource_type(name).await
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn session() -> (Arc<MemoryLedgerStore>, JobLedger) {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = JobLedger::register(store.clone(), LeaseTimeouts::default())
            .await
            .unwrap();
        (store, ledger)
    }

    #[tokio::test]
    async fn test_register_assigns_instance_id() {
        let (_, ledger) = session().await;
        assert!(ledger.instance().id > 0);
        assert!(ledger.resource_types.contains_key("Patient"));
    }

    #[tokio::test]
    async fn test_local_jobs_skip_the_store() {
        let (store, ledger) = session().await;

        ledger
            .mark_done(&LoadOutcome {
                resource_bundle_id: NO_LEDGER_ID,
                load_id: NO_LEDGER_ID,
                row_count: 3,
                failure_count: 0,
            })
            .await
            .unwrap();
        ledger
            .record_logical_id(NO_LEDGER_ID, 0, "Patient", "p1", 12)
            .await
            .unwrap();
        ledger
            .record_errors(&[BundleErrorRecord {
                load_id: NO_LEDGER_ID,
                line_number: 0,
                status_code: Some(400),
                message: "bad".into(),
                response_time_ms: 1,
            }])
            .await
            .unwrap();

        assert!(store.logical_ids().is_empty());
        assert!(store.errors().is_empty());
        assert_eq!(
            ledger.last_processed_line(NO_LEDGER_ID, 1, NO_LEDGER_ID).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_unknown_resource_type_is_added() {
        let (store, ledger) = session().await;
        let path = store.register_bucket_path("b", "").await.unwrap();
        store
            .register_bundles(
                path,
                &[ScannedObject {
                    key: "x.ndjson".into(),
                    size: 1,
                    etag: None,
                    file_type: FileType::Ndjson,
                }],
            )
            .await
            .unwrap();
        let jobs = ledger
            .allocate(FileType::Ndjson, 1, &PathFilter::default())
            .await
            .unwrap();

        ledger
            .record_logical_id(jobs[0].load_id, 4, "NutritionOrder", "n1", 5)
            .await
            .unwrap();

        let recorded = store.logical_ids();
        assert_eq!(recorded.len(), 1);
        assert_eq!(
            recorded[0].resource_type_id,
            store.ensure_resource_type("NutritionOrder").await.unwrap()
        );
    }
}
