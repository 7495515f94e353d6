//! Error types shared across the loader crates

use thiserror::Error;

/// Result type alias for FHB operations
pub type Result<T> = std::result::Result<T, FhbError>;

/// Main error type for FHB
///
/// Runtime failures travel as `anyhow::Error` with context; this type covers
/// the startup checks that reject a configuration outright.
#[derive(Error, Debug)]
pub enum FhbError {
    #[error("Configuration error: {0}")]
    Config(String),
}
