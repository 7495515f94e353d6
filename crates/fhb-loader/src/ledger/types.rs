//! Rows and parameters exchanged with the ledger

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Row id used for jobs that never touch the ledger (local directory scans)
pub const NO_LEDGER_ID: i64 = -1;

/// Content type of a bundle file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// One resource per line
    Ndjson,
    /// One JSON document, usually a Bundle
    Json,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Ndjson => "ndjson",
            FileType::Json => "json",
        }
    }

    /// Classify an object key by its extension
    pub fn from_key(key: &str) -> Option<Self> {
        let lower = key.to_ascii_lowercase();
        if lower.ends_with(".ndjson") {
            Some(FileType::Ndjson)
        } else if lower.ends_with(".json") {
            Some(FileType::Json)
        } else {
            None
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ndjson" => Ok(FileType::Ndjson),
            "json" => Ok(FileType::Json),
            other => Err(anyhow::anyhow!("Unknown file type: {}", other)),
        }
    }
}

/// Lease state of a bundle row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Ready,
    Claimed,
    Done,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Ready => "ready",
            BundleStatus::Claimed => "claimed",
            BundleStatus::Done => "done",
        }
    }
}

/// Identity of one running loader process
#[derive(Debug, Clone)]
pub struct LoaderInstance {
    pub id: i64,
    pub key: Uuid,
    pub hostname: String,
    pub pid: u32,
}

impl LoaderInstance {
    /// Fresh identity for this process; the id is assigned by registration
    pub fn local() -> Self {
        Self {
            id: NO_LEDGER_ID,
            key: Uuid::new_v4(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
        }
    }
}

/// Liveness thresholds for stale lease reclaim
#[derive(Debug, Clone, Copy)]
pub struct LeaseTimeouts {
    /// Owner heartbeat age after which its leases count as stale
    pub heartbeat_timeout: Duration,
    /// Minimum lease age before a stale lease is reclaimed
    pub recycle_after: Duration,
}

impl Default for LeaseTimeouts {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            recycle_after: Duration::from_secs(120),
        }
    }
}

/// Object key prefixes an allocation is restricted to (empty = everything)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathFilter {
    prefixes: Vec<String>,
}

impl PathFilter {
    pub fn new(prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn matches(&self, key: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Prefixes as SQL `LIKE` patterns with wildcards escaped
    pub fn like_patterns(&self) -> Vec<String> {
        self.prefixes
            .iter()
            .map(|p| {
                let escaped = p
                    .replace('\\', "\\\\")
                    .replace('%', "\\%")
                    .replace('_', "\\_");
                format!("{}%", escaped)
            })
            .collect()
    }
}

/// A bundle row claimed by this instance, with the load row created for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedBundle {
    pub resource_bundle_id: i64,
    pub load_id: i64,
    pub bucket: String,
    pub key: String,
    pub file_type: FileType,
    pub version: i32,
    pub size: i64,
}

/// An object discovered by a bucket scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedObject {
    pub key: String,
    pub size: i64,
    pub etag: Option<String>,
    pub file_type: FileType,
}

/// Effect of registering scanned objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterSummary {
    pub inserted: u64,
    pub changed: u64,
    pub unchanged: u64,
}

/// Final counts for a completed load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub resource_bundle_id: i64,
    pub load_id: i64,
    pub row_count: i64,
    pub failure_count: i64,
}

/// Downstream identity assigned to the resource at a given line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalIdRecord {
    pub load_id: i64,
    pub line_number: i64,
    pub resource_type_id: i32,
    pub logical_id: String,
    pub response_time_ms: i64,
}

/// Failure detail for the resource at a given line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleErrorRecord {
    pub load_id: i64,
    pub line_number: i64,
    pub status_code: Option<i32>,
    pub message: String,
    pub response_time_ms: i64,
}
