//! Loader configuration

use fhb_common::FhbError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::fhir::FhirClientConfig;
use crate::ledger::{FileType, LeaseTimeouts, PathFilter};
use crate::loader::{ReaderSettings, ScanTarget, StreamSettings};
use crate::storage::StorageConfig;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/fhb";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Jobs a single reader keeps outstanding
pub const DEFAULT_MAX_INFLIGHT: usize = 10;

/// Concurrent downstream requests across all readers
pub const DEFAULT_POOL_SIZE: usize = 20;

pub const DEFAULT_BUNDLE_COST_FACTOR: f64 = 0.1;

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_STALE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_RECYCLE_SECS: u64 = 120;

pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 60;
pub const DEFAULT_IDLE_BACKOFF_SECS: u64 = 10;

pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 300;

pub const DEFAULT_FHIR_URL: &str = "http://localhost:9080/fhir-server/api/v4";
pub const DEFAULT_FHIR_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub source: SourceConfig,
    pub engine: EngineConfig,
    pub lease: LeaseConfig,
    pub fhir: FhirConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Where bundle files come from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub buckets: Vec<String>,
    /// Key prefixes to scan and allocate from; empty means everything
    pub path_prefixes: Vec<String>,
    /// Load a local directory instead of buckets; no ledger is used
    pub local_dir: Option<PathBuf>,
    pub file_types: Vec<FileType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_inflight: usize,
    pub pool_size: usize,
    pub bundle_cost_factor: f64,
    pub incremental: bool,
    pub error_backoff_secs: u64,
    pub idle_backoff_secs: u64,
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub heartbeat_interval_secs: u64,
    pub stale_timeout_secs: u64,
    pub recycle_secs: u64,
    pub scan_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FhirConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub tenant: Option<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|s| {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl LoaderConfig {
    /// Load from `.env` and the environment
    ///
    /// Not validated; callers apply CLI overrides first, then [`Self::validate`].
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let file_types = match std::env::var("FHB_FILE_TYPES") {
            Ok(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(FileType::from_str)
                .collect::<anyhow::Result<Vec<_>>>()?,
            Err(_) => vec![FileType::Ndjson, FileType::Json],
        };

        let config = Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            storage: StorageConfig::from_env(),
            source: SourceConfig {
                buckets: env_list("FHB_BUCKETS"),
                path_prefixes: env_list("FHB_PATH_PREFIXES"),
                local_dir: std::env::var("FHB_LOCAL_DIR").ok().map(PathBuf::from),
                file_types,
            },
            engine: EngineConfig {
                max_inflight: env_or("FHB_MAX_INFLIGHT", DEFAULT_MAX_INFLIGHT),
                pool_size: env_or("FHB_POOL_SIZE", DEFAULT_POOL_SIZE),
                bundle_cost_factor: env_or("FHB_BUNDLE_COST_FACTOR", DEFAULT_BUNDLE_COST_FACTOR),
                incremental: env_or("FHB_INCREMENTAL", true),
                error_backoff_secs: env_or("FHB_ERROR_BACKOFF_SECS", DEFAULT_ERROR_BACKOFF_SECS),
                idle_backoff_secs: env_or("FHB_IDLE_BACKOFF_SECS", DEFAULT_IDLE_BACKOFF_SECS),
                stop_timeout_secs: env_or("FHB_STOP_TIMEOUT_SECS", DEFAULT_STOP_TIMEOUT_SECS),
            },
            lease: LeaseConfig {
                heartbeat_interval_secs: env_or(
                    "FHB_HEARTBEAT_INTERVAL_SECS",
                    DEFAULT_HEARTBEAT_INTERVAL_SECS,
                ),
                stale_timeout_secs: env_or("FHB_STALE_TIMEOUT_SECS", DEFAULT_STALE_TIMEOUT_SECS),
                recycle_secs: env_or("FHB_RECYCLE_SECS", DEFAULT_RECYCLE_SECS),
                scan_interval_secs: env_or("FHB_SCAN_INTERVAL_SECS", DEFAULT_SCAN_INTERVAL_SECS),
            },
            fhir: FhirConfig {
                url: std::env::var("FHB_FHIR_URL").unwrap_or_else(|_| DEFAULT_FHIR_URL.to_string()),
                timeout_secs: env_or("FHB_FHIR_TIMEOUT_SECS", DEFAULT_FHIR_TIMEOUT_SECS),
                user: std::env::var("FHB_FHIR_USER").ok(),
                password: std::env::var("FHB_FHIR_PASSWORD").ok(),
                tenant: std::env::var("FHB_FHIR_TENANT").ok(),
            },
        };

        Ok(config)
    }

    pub fn validate(&self) -> fhb_common::Result<()> {
        if self.engine.max_inflight == 0 {
            return Err(FhbError::Config("max_inflight must be greater than 0".into()));
        }
        if self.engine.pool_size == 0 {
            return Err(FhbError::Config("pool_size must be greater than 0".into()));
        }
        let factor = self.engine.bundle_cost_factor;
        if factor.is_nan() || factor.is_infinite() || factor <= 0.0 {
            return Err(FhbError::Config(format!(
                "bundle_cost_factor must be a positive number, got {}",
                self.engine.bundle_cost_factor
            )));
        }
        if self.lease.stale_timeout_secs <= self.lease.heartbeat_interval_secs {
            return Err(FhbError::Config(format!(
                "stale timeout ({}s) must exceed the heartbeat interval ({}s)",
                self.lease.stale_timeout_secs, self.lease.heartbeat_interval_secs
            )));
        }
        if self.source.file_types.is_empty() {
            return Err(FhbError::Config("at least one file type is required".into()));
        }
        if self.source.local_dir.is_none() && self.source.buckets.is_empty() {
            return Err(FhbError::Config(
                "set FHB_LOCAL_DIR or at least one bucket in FHB_BUCKETS".into(),
            ));
        }
        if self.source.local_dir.is_none() {
            if self.database.url.is_empty() {
                return Err(FhbError::Config("database URL cannot be empty".into()));
            }
            if self.database.min_connections > self.database.max_connections {
                return Err(FhbError::Config(format!(
                    "database min_connections ({}) cannot exceed max_connections ({})",
                    self.database.min_connections, self.database.max_connections
                )));
            }
        }
        Ok(())
    }

    pub fn lease_timeouts(&self) -> LeaseTimeouts {
        LeaseTimeouts {
            heartbeat_timeout: Duration::from_secs(self.lease.stale_timeout_secs),
            recycle_after: Duration::from_secs(self.lease.recycle_secs),
        }
    }

    pub fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            max_inflight: self.engine.max_inflight,
            error_backoff: Duration::from_secs(self.engine.error_backoff_secs),
            idle_backoff: Duration::from_secs(self.engine.idle_backoff_secs),
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            bundle_cost_factor: self.engine.bundle_cost_factor,
            incremental: self.engine.incremental,
        }
    }

    pub fn fhir_client(&self) -> FhirClientConfig {
        FhirClientConfig {
            base_url: self.fhir.url.clone(),
            timeout: Duration::from_secs(self.fhir.timeout_secs),
            username: self.fhir.user.clone(),
            password: self.fhir.password.clone(),
            tenant: self.fhir.tenant.clone(),
        }
    }

    pub fn path_filter(&self) -> PathFilter {
        PathFilter::new(self.source.path_prefixes.iter().cloned())
    }

    pub fn scan_targets(&self) -> Vec<ScanTarget> {
        ScanTarget::expand(&self.source.buckets, &self.source.path_prefixes)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.stop_timeout_secs)
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            storage: StorageConfig {
                endpoint: None,
                region: "us-east-1".to_string(),
                access_key: None,
                secret_key: None,
                path_style: false,
            },
            source: SourceConfig {
                buckets: Vec::new(),
                path_prefixes: Vec::new(),
                local_dir: None,
                file_types: vec![FileType::Ndjson, FileType::Json],
            },
            engine: EngineConfig {
                max_inflight: DEFAULT_MAX_INFLIGHT,
                pool_size: DEFAULT_POOL_SIZE,
                bundle_cost_factor: DEFAULT_BUNDLE_COST_FACTOR,
                incremental: true,
                error_backoff_secs: DEFAULT_ERROR_BACKOFF_SECS,
                idle_backoff_secs: DEFAULT_IDLE_BACKOFF_SECS,
                stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            },
            lease: LeaseConfig {
                heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
                stale_timeout_secs: DEFAULT_STALE_TIMEOUT_SECS,
                recycle_secs: DEFAULT_RECYCLE_SECS,
                scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            },
            fhir: FhirConfig {
                url: DEFAULT_FHIR_URL.to_string(),
                timeout_secs: DEFAULT_FHIR_TIMEOUT_SECS,
                user: None,
                password: None,
                tenant: None,
            },
        }
    }
}
