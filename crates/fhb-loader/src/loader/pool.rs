//! Shared worker pool for job and record tasks
//!
//! Job tasks are spawned without a permit; each reader's inflight budget
//! already bounds them. Record submissions hold `min(cost, size)` permits
//! while they run, so a large bundle occupies more of the pool than a single
//! resource.

use anyhow::{anyhow, Result};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    tasks: TaskTracker,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            tasks: TaskTracker::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for `cost` units of capacity, capped at the pool size
    pub async fn acquire(&self, cost: usize) -> Result<OwnedSemaphorePermit> {
        let units = cost.clamp(1, self.size) as u32;
        self.permits
            .clone()
            .acquire_many_owned(units)
            .await
            .map_err(|_| anyhow!("Worker pool is closed"))
    }

    /// Run a job task on the pool
    pub fn spawn_job<F>(&self, label: String, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(guarded(label, task));
    }

    /// Wait for capacity, then run a record task holding it
    pub async fn spawn_with_permit<F>(&self, cost: usize, label: String, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self.acquire(cost).await?;
        self.tasks.spawn(async move {
            let _permit = permit;
            guarded(label, task).await;
        });
        Ok(())
    }

    /// Refuse new record work and wait for running tasks, up to `timeout`
    ///
    /// Returns false if tasks were still running when the timeout expired.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.permits.close();
        self.tasks.close();

        let active = self.tasks.len();
        if active > 0 {
            debug!(active, "Waiting for worker tasks");
        }

        match tokio::time::timeout(timeout, self.tasks.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    active = self.tasks.len(),
                    timeout_secs = timeout.as_secs(),
                    "Worker tasks still running after drain timeout"
                );
                false
            },
        }
    }
}

async fn guarded<F>(label: String, task: F)
where
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
        error!(task = %label, panic = %panic_message(panic.as_ref()), "Worker task panicked");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
