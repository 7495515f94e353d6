//! Registers bucket objects in the ledger as loadable bundles

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ledger::{FileType, JobLedger, RegisterSummary, ScannedObject};
use crate::storage::{key_directory, ObjectSource};

/// One bucket and key prefix to list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub bucket: String,
    pub prefix: String,
}

impl ScanTarget {
    /// Every bucket crossed with every prefix; no prefixes means whole buckets
    pub fn expand(buckets: &[String], prefixes: &[String]) -> Vec<Self> {
        let prefixes: Vec<&str> = if prefixes.is_empty() {
            vec![""]
        } else {
            prefixes.iter().map(String::as_str).collect()
        };

        buckets
            .iter()
            .flat_map(|bucket| {
                prefixes.iter().map(move |prefix| ScanTarget {
                    bucket: bucket.clone(),
                    prefix: prefix.to_string(),
                })
            })
            .collect()
    }
}

pub struct BucketScanner {
    ledger: Arc<JobLedger>,
    source: Arc<dyn ObjectSource>,
    targets: Vec<ScanTarget>,
    file_types: Vec<FileType>,
}

impl BucketScanner {
    pub fn new(
        ledger: Arc<JobLedger>,
        source: Arc<dyn ObjectSource>,
        targets: Vec<ScanTarget>,
        file_types: Vec<FileType>,
    ) -> Self {
        Self {
            ledger,
            source,
            targets,
            file_types,
        }
    }

    /// List every target once and upsert what was found
    pub async fn scan_once(&self) -> Result<RegisterSummary> {
        let mut total = RegisterSummary::default();

        for target in &self.targets {
            let summary = self.scan_target(target).await?;
            total.inserted += summary.inserted;
            total.changed += summary.changed;
            total.unchanged += summary.unchanged;
        }

        info!(
            targets = self.targets.len(),
            inserted = total.inserted,
            changed = total.changed,
            unchanged = total.unchanged,
            "Bucket scan complete"
        );
        Ok(total)
    }

    async fn scan_target(&self, target: &ScanTarget) -> Result<RegisterSummary> {
        let objects = self
            .source
            .list(&target.bucket, &target.prefix)
            .await
            .with_context(|| format!("Failed to scan {}/{}", target.bucket, target.prefix))?;

        let mut by_directory: BTreeMap<&str, Vec<ScannedObject>> = BTreeMap::new();
        for object in &objects {
            let Some(file_type) = FileType::from_key(&object.key) else {
                continue;
            };
            if !self.file_types.contains(&file_type) {
                continue;
            }
            by_directory
                .entry(key_directory(&object.key))
                .or_default()
                .push(ScannedObject {
                    key: object.key.clone(),
                    size: object.size,
                    etag: object.etag.clone(),
                    file_type,
                });
        }

        let store = self.ledger.store();
        let mut summary = RegisterSummary::default();
        for (directory, scanned) in by_directory {
            let path_id = store.register_bucket_path(&target.bucket, directory).await?;
            let registered = store.register_bundles(path_id, &scanned).await?;
            debug!(
                bucket = %target.bucket,
                path = directory,
                inserted = registered.inserted,
                changed = registered.changed,
                "Registered bundles"
            );
            summary.inserted += registered.inserted;
            summary.changed += registered.changed;
            summary.unchanged += registered.unchanged;
        }

        Ok(summary)
    }

    /// Rescan every `period` until cancelled; the first scan is one period out
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {},
                    _ = cancel.cancelled() => break,
                }
                if let Err(e) = self.scan_once().await {
                    warn!(error = %format!("{:#}", e), "Bucket scan failed");
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ledger::{LeaseTimeouts, MemoryLedgerStore, PathFilter};
    use crate::storage::LocalStorage;

    #[test]
    fn test_expand_targets() {
        let buckets = vec!["a".to_string(), "b".to_string()];
        assert_eq!(ScanTarget::expand(&buckets, &[]).len(), 2);
        let targets = ScanTarget::expand(&buckets, &["x/".to_string(), "y/".to_string()]);
        assert_eq!(targets.len(), 4);
        assert_eq!(targets[3], ScanTarget { bucket: "b".into(), prefix: "y/".into() });
    }

    #[tokio::test]
    async fn test_scan_registers_and_versions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("run1")).unwrap();
        std::fs::write(dir.path().join("run1/p.ndjson"), "{}\n").unwrap();
        std::fs::write(dir.path().join("run1/b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("skip.csv"), "x").unwrap();

        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = Arc::new(JobLedger::register(store.clone(), LeaseTimeouts::default()).await.unwrap());
        let scanner = BucketScanner::new(
            ledger.clone(),
            Arc::new(LocalStorage::new(dir.path())),
            ScanTarget::expand(&["local".to_string()], &[]),
            vec![FileType::Ndjson, FileType::Json],
        );

        let first = scanner.scan_once().await.unwrap();
        assert_eq!(first.inserted, 2);
        let again = scanner.scan_once().await.unwrap();
        assert_eq!(again.unchanged, 2);

        let jobs = ledger
            .allocate(FileType::Ndjson, 5, &PathFilter::default())
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].bucket, "local");
        assert_eq!(jobs[0].key, "run1/p.ndjson");
    }
}
