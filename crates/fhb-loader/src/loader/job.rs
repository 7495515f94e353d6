//! One leased unit of work: a bundle file and its completion state

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::warn;

use super::completion::CompletionTracker;
use crate::ledger::{AllocatedBundle, FileType, LoadOutcome, NO_LEDGER_ID};

/// Receives a job once it is fully drained
#[async_trait]
pub trait JobDoneHandler: Send + Sync {
    async fn on_job_done(&self, job: &BucketJob);
}

/// Counters and timing of a finished job
#[derive(Debug, Clone, Copy)]
pub struct JobStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub elapsed: Duration,
    /// Records per second, `NaN` when there is nothing to divide by
    pub throughput: f64,
}

pub struct BucketJob {
    bucket: String,
    key: String,
    file_type: FileType,
    resource_bundle_id: i64,
    load_id: i64,
    version: i32,
    size: i64,
    tracker: CompletionTracker,
    /// Entries carried by submitted bundles
    bundle_entries: AtomicU64,
    last_call_ms: AtomicI64,
    /// The stream ended early; counted as one extra failure
    stream_failed: AtomicBool,
    created: Instant,
    started: OnceLock<Instant>,
    finished: OnceLock<Instant>,
    done_handler: OnceLock<Arc<dyn JobDoneHandler>>,
}

impl BucketJob {
    fn new(
        bucket: String,
        key: String,
        file_type: FileType,
        resource_bundle_id: i64,
        load_id: i64,
        version: i32,
        size: i64,
    ) -> Self {
        Self {
            bucket,
            key,
            file_type,
            resource_bundle_id,
            load_id,
            version,
            size,
            tracker: CompletionTracker::new(),
            bundle_entries: AtomicU64::new(0),
            last_call_ms: AtomicI64::new(0),
            stream_failed: AtomicBool::new(false),
            created: Instant::now(),
            started: OnceLock::new(),
            finished: OnceLock::new(),
            done_handler: OnceLock::new(),
        }
    }

    pub fn from_allocation(bundle: AllocatedBundle) -> Self {
        Self::new(
            bundle.bucket,
            bundle.key,
            bundle.file_type,
            bundle.resource_bundle_id,
            bundle.load_id,
            bundle.version,
            bundle.size,
        )
    }

    /// A file found by a directory scan; never touches the ledger
    pub fn local(key: impl Into<String>, file_type: FileType, size: i64) -> Self {
        Self::new(
            String::new(),
            key.into(),
            file_type,
            NO_LEDGER_ID,
            NO_LEDGER_ID,
            1,
            size,
        )
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn resource_bundle_id(&self) -> i64 {
        self.resource_bundle_id
    }

    pub fn load_id(&self) -> i64 {
        self.load_id
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn is_ledger_job(&self) -> bool {
        self.load_id != NO_LEDGER_ID
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    /// Attach the completion callback; only the first registration sticks
    pub fn set_done_handler(&self, handler: Arc<dyn JobDoneHandler>) -> bool {
        self.done_handler.set(handler).is_ok()
    }

    pub fn mark_started(&self) {
        let _ = self.started.set(Instant::now());
    }

    /// Count a record about to be handed downstream
    pub fn record_submitted(&self, bundle_entries: usize) {
        self.bundle_entries
            .fetch_add(bundle_entries as u64, Ordering::Relaxed);
        self.tracker.record_submitted();
    }

    /// Downstream answer for one submitted record
    pub async fn operation_complete(&self, success: bool, response_time_ms: i64) {
        self.last_call_ms.store(response_time_ms, Ordering::Relaxed);
        if self.tracker.operation_complete(success) {
            self.finish().await;
        }
    }

    /// No further records will come from this job's stream
    pub async fn file_processing_complete(&self) {
        if self.tracker.stream_complete() {
            self.finish().await;
        }
    }

    /// Record that the stream could not be read to the end
    ///
    /// Must be called before [`Self::file_processing_complete`].
    pub fn mark_stream_failed(&self) {
        self.stream_failed.store(true, Ordering::Release);
    }

    pub fn stream_failed(&self) -> bool {
        self.stream_failed.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.tracker.is_done()
    }

    async fn finish(&self) {
        let _ = self.finished.set(Instant::now());
        match self.done_handler.get() {
            Some(handler) => handler.on_job_done(self).await,
            None => warn!(job = %self, "Job finished without a completion handler"),
        }
    }

    pub fn stats(&self) -> JobStats {
        let start = self.started.get().copied().unwrap_or(self.created);
        let end = self.finished.get().copied().unwrap_or_else(Instant::now);
        let elapsed = end.saturating_duration_since(start);

        let submitted = self.tracker.submitted();
        let succeeded = self.tracker.succeeded();
        let failed = self.tracker.failed();
        let entries = self.bundle_entries.load(Ordering::Relaxed);

        // A whole-file bundle is one call; its entries over that call's time
        // is the only meaningful rate.
        let throughput = if self.file_type == FileType::Json && submitted == 1 && entries > 0 {
            let ms = self.last_call_ms.load(Ordering::Relaxed);
            if ms == 0 {
                f64::NAN
            } else {
                entries as f64 * 1000.0 / ms as f64
            }
        } else if elapsed.is_zero() {
            f64::NAN
        } else {
            (succeeded + failed) as f64 / elapsed.as_secs_f64()
        };

        JobStats {
            submitted,
            succeeded,
            failed,
            elapsed,
            throughput,
        }
    }

    pub fn outcome(&self) -> LoadOutcome {
        LoadOutcome {
            resource_bundle_id: self.resource_bundle_id,
            load_id: self.load_id,
            row_count: self.tracker.submitted() as i64,
            failure_count: self.tracker.failed() as i64 + i64::from(self.stream_failed()),
        }
    }
}

impl fmt::Display for BucketJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bucket.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}/{}", self.bucket, self.key)
        }
    }
}

impl fmt::Debug for BucketJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketJob")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("file_type", &self.file_type)
            .field("resource_bundle_id", &self.resource_bundle_id)
            .field("load_id", &self.load_id)
            .field("version", &self.version)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}
