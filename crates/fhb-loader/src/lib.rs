//! FHB Loader Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Bulk loader that streams FHIR bundle files from object storage into a
//! FHIR server.
//!
//! # Overview
//!
//! - **Ledger**: shared PostgreSQL job ledger with lease-based allocation,
//!   so any number of loader instances can share one set of buckets
//! - **Readers**: one allocation loop per file type, each bounded by an
//!   inflight budget
//! - **Streaming**: NDJSON files are read line by line and resumed from the
//!   last recorded line; JSON files are loaded as one resource
//! - **Worker pool**: bounded, cost-weighted concurrency for downstream
//!   FHIR requests
//!
//! # Architecture
//!
//! ```text
//! BucketScanner ──> ledger ──> Reader ──> StreamProcessor ──> WorkerPool
//!                     ^                                          │
//!                     └──── mark_done <── BucketJob <── ResourceEntryProcessor
//! ```
//!
//! A job is done once its file has been fully read and every record it
//! submitted has completed, in whichever order those happen.

pub mod config;
pub mod fhir;
pub mod ledger;
pub mod loader;
pub mod service;
pub mod storage;

pub use config::LoaderConfig;
pub use ledger::{JobLedger, LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use loader::{BucketJob, Reader, ReaderState, StreamProcessor, WorkerPool};
pub use service::LoaderService;
