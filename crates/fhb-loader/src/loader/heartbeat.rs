//! Periodic liveness updates for this loader instance

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ledger::JobLedger;

/// Refresh the instance heartbeat every `period` until cancelled
///
/// A failed update is logged and retried on the next tick. Missing enough
/// ticks lets other instances reclaim this instance's leases.
pub fn spawn_heartbeat(
    ledger: Arc<JobLedger>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let instance_id = ledger.instance().id;
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = cancel.cancelled() => break,
            }

            match ledger.heartbeat().await {
                Ok(()) => {
                    if failures > 0 {
                        info!(instance_id, failures, "Heartbeat recovered");
                    }
                    failures = 0;
                    debug!(instance_id, "Heartbeat");
                },
                Err(e) => {
                    failures += 1;
                    warn!(instance_id, failures, error = %format!("{:#}", e), "Heartbeat failed");
                },
            }
        }

        debug!(instance_id, "Heartbeat stopped");
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ledger::{
        FileType, LeaseTimeouts, LedgerStore, LoaderInstance, MemoryLedgerStore, PathFilter,
        ScannedObject,
    };

    #[tokio::test]
    async fn test_heartbeat_keeps_leases_alive() {
        let store = Arc::new(MemoryLedgerStore::new());
        let timeouts = LeaseTimeouts {
            heartbeat_timeout: Duration::from_secs(60),
            recycle_after: Duration::from_secs(60),
        };
        let ledger = Arc::new(JobLedger::register(store.clone(), timeouts).await.unwrap());

        let path = store.register_bucket_path("b", "").await.unwrap();
        store
            .register_bundles(
                path,
                &[ScannedObject {
                    key: "a.ndjson".into(),
                    size: 1,
                    etag: None,
                    file_type: FileType::Ndjson,
                }],
            )
            .await
            .unwrap();
        let claimed = ledger
            .allocate(FileType::Ndjson, 1, &PathFilter::default())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let cancel = CancellationToken::new();
        let handle = spawn_heartbeat(ledger.clone(), Duration::from_millis(5), cancel.clone());

        // Heartbeats keep landing on the advanced clock, so the owner never looks stale.
        for _ in 0..3 {
            store.advance(Duration::from_secs(50));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        let other = store.register_instance(&LoaderInstance::local()).await.unwrap();
        let stolen = store
            .allocate_jobs(other, FileType::Ndjson, 1, &PathFilter::default(), &timeouts)
            .await
            .unwrap();
        assert!(stolen.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
