//! Allocation and backpressure loop
//!
//! A reader keeps at most `max_inflight` jobs outstanding. It sleeps while
//! inflight is at or above the rescan threshold (half the budget), then asks
//! its allocator for as many jobs as there are free slots and hands each one
//! to the shared pool. The loop never does record work itself.
//!
//! The loop ends when an allocation returns nothing while nothing is in
//! flight, or when [`Reader::stop`] is called. Either way it then waits for
//! dispatched jobs to drain before reporting [`ReaderState::Stopped`].

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::allocator::LeaseAllocator;
use super::job::{BucketJob, JobDoneHandler};
use super::pool::WorkerPool;
use super::stream::StreamProcessor;
use crate::ledger::JobLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    Scanning,
    Waiting,
    Allocating,
    Dispatching,
    Draining,
    Stopped,
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReaderState::Idle => "idle",
            ReaderState::Scanning => "scanning",
            ReaderState::Waiting => "waiting",
            ReaderState::Allocating => "allocating",
            ReaderState::Dispatching => "dispatching",
            ReaderState::Draining => "draining",
            ReaderState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    pub max_inflight: usize,
    /// Sleep after a failed allocation
    pub error_backoff: Duration,
    /// Sleep after an allocation that could not fill every free slot
    pub idle_backoff: Duration,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            max_inflight: 10,
            error_backoff: Duration::from_secs(60),
            idle_backoff: Duration::from_secs(10),
        }
    }
}

impl ReaderSettings {
    pub fn rescan_threshold(&self) -> usize {
        (self.max_inflight / 2).max(1)
    }
}

/// Inflight counter with a wakeup for waiters
struct InflightGate {
    inflight: Mutex<usize>,
    changed: Notify,
    max: usize,
    threshold: usize,
    peak: AtomicUsize,
}

impl InflightGate {
    fn new(max: usize, threshold: usize) -> Self {
        Self {
            inflight: Mutex::new(0),
            changed: Notify::new(),
            max,
            threshold,
            peak: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> usize {
        *self.lock()
    }

    fn free(&self) -> usize {
        self.max.saturating_sub(*self.lock())
    }

    fn add(&self, n: usize) -> usize {
        let mut inflight = self.lock();
        *inflight += n;
        debug_assert!(*inflight <= self.max);
        self.peak.fetch_max(*inflight, Ordering::Relaxed);
        *inflight
    }

    fn release(&self) -> usize {
        let now = {
            let mut inflight = self.lock();
            *inflight = inflight.saturating_sub(1);
            *inflight
        };
        if now < self.threshold {
            self.changed.notify_waiters();
        }
        now
    }

    /// Wait until `ready(inflight)` holds; false if cancelled first
    async fn wait_until(&self, cancel: &CancellationToken, ready: impl Fn(usize) -> bool) -> bool {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return false;
            }
            if ready(self.current()) {
                return true;
            }

            tokio::select! {
                _ = &mut notified => {},
                _ = cancel.cancelled() => return false,
            }
        }
    }
}

struct ReaderInner {
    name: String,
    allocator: Arc<dyn LeaseAllocator>,
    processor: Arc<StreamProcessor>,
    pool: Arc<WorkerPool>,
    ledger: Option<Arc<JobLedger>>,
    settings: ReaderSettings,
    gate: InflightGate,
    state: watch::Sender<ReaderState>,
    cancel: CancellationToken,
}

impl ReaderInner {
    fn set_state(&self, state: ReaderState) {
        self.state.send_replace(state);
    }

    /// Sleep unless stopped first; true if the reader should exit
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        self.set_state(ReaderState::Scanning);
        self.allocator.prepare().await?;

        info!(
            reader = %self.name,
            max_inflight = self.settings.max_inflight,
            rescan_threshold = self.gate.threshold,
            "Reader started"
        );

        loop {
            self.set_state(ReaderState::Waiting);
            let threshold = self.gate.threshold;
            if !self.gate.wait_until(&self.cancel, |n| n < threshold).await {
                break;
            }

            self.set_state(ReaderState::Allocating);
            let free = self.gate.free();
            if free == 0 {
                continue;
            }

            if self.cancel.is_cancelled() {
                break;
            }
            // Not raced against cancel: a claim that has committed must be dispatched.
            let jobs = match self.allocator.allocate(free).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(
                        reader = %self.name,
                        error = %format!("{:#}", e),
                        backoff_secs = self.settings.error_backoff.as_secs(),
                        "Allocation failed"
                    );
                    if self.pause(self.settings.error_backoff).await {
                        break;
                    }
                    continue;
                },
            };

            let allocated = jobs.len();
            let inflight = self.gate.add(allocated);
            if inflight == 0 && allocated == 0 {
                info!(reader = %self.name, "No more work available");
                break;
            }

            self.set_state(ReaderState::Dispatching);
            debug!(reader = %self.name, allocated, inflight, "Dispatching jobs");
            for job in jobs {
                self.dispatch(job);
            }

            if allocated < free && self.pause(self.settings.idle_backoff).await {
                break;
            }
        }

        self.set_state(ReaderState::Draining);
        let inflight = self.gate.current();
        if inflight > 0 {
            info!(reader = %self.name, inflight, "Waiting for dispatched jobs");
        }
        self.gate
            .wait_until(&CancellationToken::new(), |n| n == 0)
            .await;

        info!(reader = %self.name, peak_inflight = self.gate.peak.load(Ordering::Relaxed), "Reader stopped");
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, job: BucketJob) {
        let job = Arc::new(job);
        job.set_done_handler(self.clone());

        let processor = self.processor.clone();
        self.pool.spawn_job(job.to_string(), async move {
            processor.process(job).await;
        });
    }
}

#[async_trait]
impl JobDoneHandler for ReaderInner {
    async fn on_job_done(&self, job: &BucketJob) {
        let stats = job.stats();
        info!(
            reader = %self.name,
            job = %job,
            submitted = stats.submitted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            per_sec = %format!("{:.1}", stats.throughput),
            "Job complete"
        );

        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.mark_done(&job.outcome()).await {
                warn!(job = %job, error = %format!("{:#}", e), "Failed to mark job done");
            }
        }

        self.gate.release();
    }
}

/// Handle to one running allocation loop
pub struct Reader {
    inner: Arc<ReaderInner>,
    state: watch::Receiver<ReaderState>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Reader {
    /// Spawn the loop on the current runtime
    pub fn start(
        name: impl Into<String>,
        allocator: Arc<dyn LeaseAllocator>,
        processor: Arc<StreamProcessor>,
        pool: Arc<WorkerPool>,
        ledger: Option<Arc<JobLedger>>,
        settings: ReaderSettings,
    ) -> Self {
        let settings = ReaderSettings {
            max_inflight: settings.max_inflight.max(1),
            ..settings
        };
        let (state_tx, state_rx) = watch::channel(ReaderState::Idle);

        let inner = Arc::new(ReaderInner {
            name: name.into(),
            allocator,
            processor,
            pool,
            ledger,
            gate: InflightGate::new(settings.max_inflight, settings.rescan_threshold()),
            settings,
            state: state_tx,
            cancel: CancellationToken::new(),
        });

        let task = inner.clone();
        let handle = tokio::spawn(async move {
            let result = task.clone().run().await;
            if let Err(e) = &result {
                error!(reader = %task.name, error = %format!("{:#}", e), "Reader failed");
            }
            task.set_state(ReaderState::Stopped);
            result
        });

        Self {
            inner,
            state: state_rx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ReaderState {
        *self.state.borrow()
    }

    pub fn inflight(&self) -> usize {
        self.inner.gate.current()
    }

    /// Highest inflight count observed so far
    pub fn peak_inflight(&self) -> usize {
        self.inner.gate.peak.load(Ordering::Relaxed)
    }

    /// Ask the loop to exit; dispatched jobs keep running
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Resolves once the reader has reached [`ReaderState::Stopped`]
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ReaderState::Stopped).await;
    }

    /// Stop and wait up to `timeout`; false if the reader is still draining
    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        self.stop();
        match tokio::time::timeout(timeout, self.stopped()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    reader = %self.inner.name,
                    state = %self.state(),
                    inflight = self.inflight(),
                    "Reader did not stop in time"
                );
                false
            },
        }
    }

    /// Result of the loop; call after the reader has stopped
    pub async fn join(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }
}
