//! Process wiring: connects the pieces and runs them until done or shut down

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::LoaderConfig;
use crate::fhir::{FhirClient, HttpFhirClient};
use crate::ledger::{JobLedger, PgLedgerStore};
use crate::loader::{
    spawn_heartbeat, BucketScanner, DirectoryAllocator, LeaseAllocator, LedgerAllocator, Reader,
    ResourceEntryProcessor, StreamProcessor, WorkerPool,
};
use crate::storage::{LocalStorage, ObjectSource, Storage};

pub struct LoaderService {
    config: LoaderConfig,
    client: Arc<dyn FhirClient>,
}

impl LoaderService {
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let client = HttpFhirClient::new(&config.fhir_client())?;
        info!(fhir_url = %client.base_url(), "FHIR client ready");
        Ok(Self::with_client(config, Arc::new(client)))
    }

    /// Use a prebuilt downstream client
    pub fn with_client(config: LoaderConfig, client: Arc<dyn FhirClient>) -> Self {
        Self { config, client }
    }

    /// Run until all work is done or ctrl-c is received
    pub async fn run(&self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                signal.cancel();
            }
        });
        self.run_until(shutdown).await
    }

    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<()> {
        let pool = Arc::new(WorkerPool::new(self.config.engine.pool_size));

        match &self.config.source.local_dir {
            Some(dir) => self.run_local(dir.clone(), pool, shutdown).await,
            None => self.run_buckets(pool, shutdown).await,
        }
    }

    async fn run_local(
        &self,
        dir: std::path::PathBuf,
        pool: Arc<WorkerPool>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(dir = %dir.display(), "Loading local directory");

        let storage = LocalStorage::new(dir);
        let allocator: Arc<dyn LeaseAllocator> = Arc::new(DirectoryAllocator::new(
            storage.clone(),
            self.config.source.file_types.clone(),
        ));
        let processor = Arc::new(StreamProcessor::new(
            Arc::new(storage),
            Arc::new(ResourceEntryProcessor::new(self.client.clone(), None)),
            pool.clone(),
            None,
            self.config.stream_settings(),
        ));

        let reader = Reader::start(
            allocator.describe(),
            allocator,
            processor,
            pool.clone(),
            None,
            self.config.reader_settings(),
        );

        self.supervise(vec![reader], pool, shutdown).await
    }

    async fn run_buckets(&self, pool: Arc<WorkerPool>, shutdown: CancellationToken) -> Result<()> {
        let db = &self.config.database;
        let db_pool = PgPoolOptions::new()
            .max_connections(db.max_connections)
            .min_connections(db.min_connections)
            .acquire_timeout(Duration::from_secs(db.connect_timeout_secs))
            .connect(&db.url)
            .await
            .context("Failed to connect to the ledger database")?;

        let store = PgLedgerStore::new(db_pool);
        store.migrate().await?;

        let ledger = Arc::new(
            JobLedger::register(Arc::new(store), self.config.lease_timeouts()).await?,
        );
        ledger.clear_stale().await?;

        let background = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = vec![spawn_heartbeat(
            ledger.clone(),
            Duration::from_secs(self.config.lease.heartbeat_interval_secs),
            background.clone(),
        )];

        let source: Arc<dyn ObjectSource> = Arc::new(Storage::new(self.config.storage.clone()).await?);

        let scanner = Arc::new(BucketScanner::new(
            ledger.clone(),
            source.clone(),
            self.config.scan_targets(),
            self.config.source.file_types.clone(),
        ));
        if let Err(e) = scanner.scan_once().await {
            warn!(error = %format!("{:#}", e), "Initial bucket scan failed");
        }
        tasks.push(scanner.spawn(
            Duration::from_secs(self.config.lease.scan_interval_secs),
            background.clone(),
        ));

        let processor = Arc::new(StreamProcessor::new(
            source,
            Arc::new(ResourceEntryProcessor::new(
                self.client.clone(),
                Some(ledger.clone()),
            )),
            pool.clone(),
            Some(ledger.clone()),
            self.config.stream_settings(),
        ));

        let readers = self
            .config
            .source
            .file_types
            .iter()
            .map(|file_type| {
                let allocator: Arc<dyn LeaseAllocator> = Arc::new(LedgerAllocator::new(
                    ledger.clone(),
                    *file_type,
                    self.config.path_filter(),
                ));
                Reader::start(
                    allocator.describe(),
                    allocator,
                    processor.clone(),
                    pool.clone(),
                    Some(ledger.clone()),
                    self.config.reader_settings(),
                )
            })
            .collect();

        let result = self.supervise(readers, pool, shutdown).await;

        background.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        result
    }

    /// Wait for the readers to finish or for shutdown, then stop everything
    async fn supervise(
        &self,
        readers: Vec<Reader>,
        pool: Arc<WorkerPool>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let all_stopped = futures::future::join_all(readers.iter().map(Reader::stopped));
        tokio::select! {
            _ = all_stopped => info!("All readers finished"),
            _ = shutdown.cancelled() => info!("Stopping readers"),
        }

        let timeout = self.config.stop_timeout();
        let mut first_error = None;
        for reader in &readers {
            if !reader.wait_for_stop(timeout).await {
                continue;
            }
            if let Err(e) = reader.join().await {
                error!(reader = reader.name(), error = %format!("{:#}", e), "Reader exited with error");
                first_error.get_or_insert(e);
            }
        }

        if !pool.drain(timeout).await {
            warn!("Shutting down with worker tasks still running");
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Loader finished");
                Ok(())
            },
        }
    }
}
