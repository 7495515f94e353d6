//! Turns a job's byte stream into validated records
//!
//! NDJSON files yield one record per line; JSON files are one document at
//! line 0. A record that fails to parse or validate is logged and dropped.
//! Nothing here waits for downstream completion: records are handed to the
//! pool and the stream moves on.

use anyhow::{Context, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tracing::{debug, error, info, warn};

use super::entry::{RecordHandler, ResourceEntry};
use super::job::BucketJob;
use super::pool::{panic_message, WorkerPool};
use crate::fhir::{has_errors, validate, Resource, Severity};
use crate::ledger::{BundleErrorRecord, FileType, JobLedger};
use crate::storage::{BoxedReader, ObjectSource};

/// Pool units a resource occupies while it is submitted
///
/// Bundles weigh `floor(factor * entries)`, never less than one.
pub fn resource_cost(resource: &Resource, bundle_cost_factor: f64) -> usize {
    if !resource.is_bundle() {
        return 1;
    }
    let weighted = (bundle_cost_factor * resource.entry_count() as f64).floor();
    if weighted.is_finite() && weighted >= 1.0 {
        weighted as usize
    } else {
        1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub bundle_cost_factor: f64,
    /// Skip lines an earlier load of the same bundle version already handled
    pub incremental: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            bundle_cost_factor: 0.1,
            incremental: true,
        }
    }
}

/// Per-stream counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    pub lines: u64,
    pub skipped: u64,
    pub submitted: u64,
    pub cost: u64,
    pub parse_failures: u64,
    pub invalid: u64,
    pub elapsed: Duration,
}

impl StreamStats {
    /// Cost units submitted per second
    pub fn cost_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.cost as f64 / secs
        } else {
            f64::NAN
        }
    }
}

pub struct StreamProcessor {
    source: Arc<dyn ObjectSource>,
    handler: Arc<dyn RecordHandler>,
    pool: Arc<WorkerPool>,
    ledger: Option<Arc<JobLedger>>,
    settings: StreamSettings,
}

impl StreamProcessor {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        handler: Arc<dyn RecordHandler>,
        pool: Arc<WorkerPool>,
        ledger: Option<Arc<JobLedger>>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            source,
            handler,
            pool,
            ledger,
            settings,
        }
    }

    /// Stream every record of `job` downstream
    ///
    /// The job's stream is always reported complete on return, whether the
    /// file was read to the end, failed, or the reading code panicked. A
    /// failed stream is recorded against the line it stopped at and counts
    /// as one failure of the job.
    pub async fn process(&self, job: Arc<BucketJob>) {
        job.mark_started();
        let started = Instant::now();
        let mut stats = StreamStats::default();

        let result = AssertUnwindSafe(self.stream(&job, &mut stats))
            .catch_unwind()
            .await;
        stats.elapsed = started.elapsed();

        let failure = match result {
            Ok(Ok(())) => {
                info!(
                    job = %job,
                    lines = stats.lines,
                    skipped = stats.skipped,
                    submitted = stats.submitted,
                    parse_failures = stats.parse_failures,
                    invalid = stats.invalid,
                    cost = stats.cost,
                    cost_per_sec = %format!("{:.1}", stats.cost_rate()),
                    "Finished reading bundle"
                );
                None
            },
            Ok(Err(e)) => {
                let message = format!("{:#}", e);
                error!(job = %job, line = stats.lines, error = %message, "Failed reading bundle");
                Some(message)
            },
            Err(panic) => {
                let message = format!("Bundle reader panicked: {}", panic_message(panic.as_ref()));
                error!(job = %job, line = stats.lines, error = %message, "Bundle reader panicked");
                Some(message)
            },
        };

        if let Some(message) = failure {
            self.record_stream_failure(&job, &stats, message).await;
        }

        job.file_processing_complete().await;
    }

    async fn record_stream_failure(&self, job: &BucketJob, stats: &StreamStats, message: String) {
        job.mark_stream_failed();

        let Some(ledger) = &self.ledger else { return };
        let record = BundleErrorRecord {
            load_id: job.load_id(),
            // Last line read; a resumed load starts again from here
            line_number: stats.lines.saturating_sub(1) as i64,
            status_code: None,
            message,
            response_time_ms: stats.elapsed.as_millis() as i64,
        };
        if let Err(e) = ledger.record_errors(&[record]).await {
            warn!(job = %job, error = %format!("{:#}", e), "Failed to record stream error");
        }
    }

    async fn stream(&self, job: &Arc<BucketJob>, stats: &mut StreamStats) -> Result<()> {
        let reader = self
            .source
            .open(job.bucket(), job.key())
            .await
            .with_context(|| format!("Failed to open {}", job))?;

        match job.file_type() {
            FileType::Ndjson => {
                let skip = self.resume_point(job).await?;
                self.stream_lines(job, reader, skip, stats).await
            },
            FileType::Json => self.stream_document(job, reader, stats).await,
        }
    }

    /// Lines to skip before emitting records
    async fn resume_point(&self, job: &BucketJob) -> Result<u64> {
        if !self.settings.incremental {
            return Ok(0);
        }
        let Some(ledger) = &self.ledger else {
            return Ok(0);
        };

        let last = ledger
            .last_processed_line(job.resource_bundle_id(), job.version(), job.load_id())
            .await
            .with_context(|| format!("Failed to find resume point for {}", job))?;

        match last {
            Some(line) if line > 0 => {
                info!(job = %job, resume_line = line, "Resuming partially loaded bundle");
                Ok(line as u64)
            },
            _ => Ok(0),
        }
    }

    async fn stream_lines(
        &self,
        job: &Arc<BucketJob>,
        mut reader: BoxedReader,
        skip: u64,
        stats: &mut StreamStats,
    ) -> Result<()> {
        let mut buf = Vec::new();
        let mut line_number: u64 = 0;

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .await
                .with_context(|| format!("Read failed at line {} of {}", line_number, job))?;
            if read == 0 {
                break;
            }

            let current = line_number;
            line_number += 1;
            stats.lines += 1;

            if current < skip {
                stats.skipped += 1;
                continue;
            }
            if buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            self.dispatch(job, &buf, current as i64, stats).await?;
        }

        Ok(())
    }

    async fn stream_document(
        &self,
        job: &Arc<BucketJob>,
        mut reader: BoxedReader,
        stats: &mut StreamStats,
    ) -> Result<()> {
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .await
            .with_context(|| format!("Failed to read {}", job))?;

        stats.lines = 1;
        self.dispatch(job, &body, 0, stats).await
    }

    /// Parse, validate and hand off one record
    ///
    /// Only pool shutdown is an error; bad records are counted and skipped.
    async fn dispatch(
        &self,
        job: &Arc<BucketJob>,
        bytes: &[u8],
        line: i64,
        stats: &mut StreamStats,
    ) -> Result<()> {
        let resource = match Resource::parse(bytes) {
            Ok(resource) => resource,
            Err(e) => {
                warn!(job = %job, line, error = %e, "Skipping unparseable record");
                stats.parse_failures += 1;
                return Ok(());
            },
        };

        let issues = validate(&resource);
        if has_errors(&issues) {
            for issue in issues.iter().filter(|i| i.severity == Severity::Error) {
                warn!(job = %job, line, issue = %issue, "Validation error");
            }
            stats.invalid += 1;
            return Ok(());
        }
        for issue in &issues {
            debug!(job = %job, line, issue = %issue, "Validation warning");
        }

        let cost = resource_cost(&resource, self.settings.bundle_cost_factor);
        let bundle_entries = if resource.is_bundle() {
            resource.entry_count()
        } else {
            0
        };

        job.record_submitted(bundle_entries);
        stats.submitted += 1;
        stats.cost += cost as u64;

        let entry = ResourceEntry::new(job.clone(), resource, line, cost);
        let handler = self.handler.clone();
        self.pool
            .spawn_with_permit(cost, format!("{}:{}", job, line), async move {
                handler.handle(entry).await;
            })
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(entries: usize) -> Resource {
        let entry: Vec<_> = (0..entries)
            .map(|_| json!({"resource": {"resourceType": "Observation"}}))
            .collect();
        Resource::from_value(json!({"resourceType": "Bundle", "type": "batch", "entry": entry})).unwrap()
    }

    #[test]
    fn test_resource_cost() {
        assert_eq!(resource_cost(&bundle(50), 0.1), 5);
        assert_eq!(resource_cost(&bundle(1), 0.1), 1);
        assert_eq!(resource_cost(&bundle(0), 0.1), 1);
        assert_eq!(resource_cost(&bundle(59), 0.1), 5);
        assert_eq!(resource_cost(&bundle(10), 2.0), 20);

        let patient = Resource::from_value(json!({"resourceType": "Patient"})).unwrap();
        assert_eq!(resource_cost(&patient, 100.0), 1);
    }

    #[test]
    fn test_cost_rate() {
        let stats = StreamStats {
            cost: 30,
            elapsed: Duration::from_secs(3),
            ..Default::default()
        };
        assert_eq!(stats.cost_rate(), 10.0);
        assert!(StreamStats::default().cost_rate().is_nan());
    }
}
