//! Allocation policies feeding a reader

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::info;

use super::job::BucketJob;
use crate::ledger::{FileType, JobLedger, PathFilter};
use crate::storage::{LocalStorage, ObjectSource};

#[async_trait]
pub trait LeaseAllocator: Send + Sync {
    /// Short name for logs
    fn describe(&self) -> String;

    /// One-time setup before the first allocation; an error here is fatal
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Up to `free_slots` new jobs; empty when nothing is available
    async fn allocate(&self, free_slots: usize) -> Result<Vec<BucketJob>>;
}

/// Claims bundles of one content type from the shared ledger
pub struct LedgerAllocator {
    ledger: Arc<JobLedger>,
    file_type: FileType,
    filter: PathFilter,
}

impl LedgerAllocator {
    pub fn new(ledger: Arc<JobLedger>, file_type: FileType, filter: PathFilter) -> Self {
        Self {
            ledger,
            file_type,
            filter,
        }
    }
}

#[async_trait]
impl LeaseAllocator for LedgerAllocator {
    fn describe(&self) -> String {
        format!("ledger:{}", self.file_type)
    }

    async fn allocate(&self, free_slots: usize) -> Result<Vec<BucketJob>> {
        let bundles = self
            .ledger
            .allocate(self.file_type, free_slots, &self.filter)
            .await?;
        Ok(bundles.into_iter().map(BucketJob::from_allocation).collect())
    }
}

/// Hands out the files of a local directory, scanned once
pub struct DirectoryAllocator {
    storage: LocalStorage,
    file_types: Vec<FileType>,
    pending: Mutex<VecDeque<BucketJob>>,
}

impl DirectoryAllocator {
    pub fn new(storage: LocalStorage, file_types: Vec<FileType>) -> Self {
        Self {
            storage,
            file_types,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LeaseAllocator for DirectoryAllocator {
    fn describe(&self) -> String {
        format!("dir:{}", self.storage.root().display())
    }

    async fn prepare(&self) -> Result<()> {
        let objects = self.storage.list("", "").await?;

        let jobs: VecDeque<BucketJob> = objects
            .into_iter()
            .filter_map(|o| {
                let file_type = FileType::from_key(&o.key)?;
                self.file_types
                    .contains(&file_type)
                    .then(|| BucketJob::local(o.key, file_type, o.size))
            })
            .collect();

        if jobs.is_empty() {
            return Err(anyhow!(
                "No bundle files found under {}",
                self.storage.root().display()
            ));
        }

        info!(
            root = %self.storage.root().display(),
            files = jobs.len(),
            "Scanned local bundle directory"
        );

        *self
            .pending
            .lock()
            .map_err(|_| anyhow!("Directory job list poisoned"))? = jobs;
        Ok(())
    }

    async fn allocate(&self, free_slots: usize) -> Result<Vec<BucketJob>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| anyhow!("Directory job list poisoned"))?;
        let take = free_slots.min(pending.len());
        Ok(pending.drain(..take).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_allocator_filters_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.ndjson", "b.ndjson", "c.json", "readme.md"] {
            std::fs::write(dir.path().join(name), "{}\n").unwrap();
        }

        let allocator = DirectoryAllocator::new(LocalStorage::new(dir.path()), vec![FileType::Ndjson]);
        allocator.prepare().await.unwrap();
        assert_eq!(allocator.remaining(), 2);

        let first = allocator.allocate(1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].key(), "a.ndjson");
        assert!(!first[0].is_ledger_job());

        assert_eq!(allocator.allocate(5).await.unwrap().len(), 1);
        assert!(allocator.allocate(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let allocator =
            DirectoryAllocator::new(LocalStorage::new(dir.path()), vec![FileType::Ndjson, FileType::Json]);
        assert!(allocator.prepare().await.is_err());
    }
}
