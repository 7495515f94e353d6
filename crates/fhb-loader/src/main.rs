//! FHB Loader - bulk FHIR bundle loader

use anyhow::Result;
use clap::Parser;
use fhb_common::logging::{init_logging, LogConfig, LogLevel};
use fhb_loader::ledger::FileType;
use fhb_loader::{LoaderConfig, LoaderService};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fhb-loader")]
#[command(author, version, about = "Load FHIR bundle files into a FHIR server")]
struct Cli {
    /// Load files from a local directory instead of buckets (no ledger)
    #[arg(long, env = "FHB_LOCAL_DIR")]
    local_dir: Option<PathBuf>,

    /// Buckets to scan, comma separated
    #[arg(long, value_delimiter = ',')]
    buckets: Vec<String>,

    /// Only load keys under these prefixes, comma separated
    #[arg(long, value_delimiter = ',')]
    path_prefixes: Vec<String>,

    /// File types to load (ndjson, json)
    #[arg(long, value_delimiter = ',')]
    file_types: Vec<FileType>,

    /// Jobs each reader keeps outstanding
    #[arg(long)]
    max_inflight: Option<usize>,

    /// Concurrent downstream requests
    #[arg(long)]
    pool_size: Option<usize>,

    /// FHIR server base URL
    #[arg(long)]
    fhir_url: Option<String>,

    /// Process every line, ignoring earlier progress
    #[arg(long)]
    no_resume: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(self, config: &mut LoaderConfig) {
        if self.local_dir.is_some() {
            config.source.local_dir = self.local_dir;
        }
        if !self.buckets.is_empty() {
            config.source.buckets = self.buckets;
        }
        if !self.path_prefixes.is_empty() {
            config.source.path_prefixes = self.path_prefixes;
        }
        if !self.file_types.is_empty() {
            config.source.file_types = self.file_types;
        }
        if let Some(max_inflight) = self.max_inflight {
            config.engine.max_inflight = max_inflight;
        }
        if let Some(pool_size) = self.pool_size {
            config.engine.pool_size = pool_size;
        }
        if let Some(url) = self.fhir_url {
            config.fhir.url = url;
        }
        if self.no_resume {
            config.engine.incremental = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("fhb-loader")
        .filter_directives("sqlx=warn,aws_smithy_runtime=info,hyper=info")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    init_logging(&log_config)?;

    let mut config = LoaderConfig::load()?;
    cli.apply(&mut config);
    config.validate()?;

    info!(
        local_dir = ?config.source.local_dir,
        buckets = ?config.source.buckets,
        file_types = ?config.source.file_types,
        max_inflight = config.engine.max_inflight,
        pool_size = config.engine.pool_size,
        "Starting FHB loader"
    );

    LoaderService::new(config)?.run().await
}
