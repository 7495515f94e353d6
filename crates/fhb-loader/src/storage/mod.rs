//! Object access for bundle files
//!
//! Readers never see where bytes come from: everything goes through
//! [`ObjectSource`]. [`Storage`] talks to S3-compatible object stores,
//! [`LocalStorage`] serves files below a directory root.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    Client,
};
use std::pin::Pin;
use tokio::io::AsyncBufRead;
use tracing::{debug, info, instrument};

pub mod config;
pub mod local;

pub use config::StorageConfig;
pub use local::LocalStorage;

/// Buffered byte stream of one object, closed when dropped
pub type BoxedReader = Pin<Box<dyn AsyncBufRead + Send>>;

/// One entry of an object listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: i64,
    pub etag: Option<String>,
}

/// Byte-stream source of bundle files
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Open an object for streaming reads
    async fn open(&self, bucket: &str, key: &str) -> Result<BoxedReader>;

    /// List every object under `prefix`
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>>;
}

/// S3-compatible object store client
#[derive(Clone)]
pub struct Storage {
    client: Client,
}

impl Storage {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        debug!(
            endpoint = ?config.endpoint,
            region = %config.region,
            path_style = config.path_style,
            "Initializing object storage client"
        );

        let mut builder = match config.static_credentials() {
            Some((access_key, secret_key)) => aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "fhb-storage",
                )),
            None => {
                let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!(region = %config.region, "Object storage client initialized");

        Ok(Self { client })
    }
}

#[async_trait]
impl ObjectSource for Storage {
    #[instrument(skip(self))]
    async fn open(&self, bucket: &str, key: &str) -> Result<BoxedReader> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to open s3://{}/{}", bucket, key))?;

        Ok(Box::pin(response.body.into_async_read()))
    }

    #[instrument(skip(self))]
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{}/{}", bucket, prefix))?;

            objects.extend(response.contents().iter().filter_map(|obj| {
                obj.key().map(|key| ObjectSummary {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0),
                    etag: obj.e_tag().map(|e| e.trim_matches('"').to_string()),
                })
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }

        debug!(bucket, prefix, count = objects.len(), "Listed objects");
        Ok(objects)
    }
}

/// Directory portion of an object key ("a/b/c.ndjson" -> "a/b")
pub fn key_directory(key: &str) -> &str {
    key.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_directory() {
        assert_eq!(key_directory("synthea/2024/patients.ndjson"), "synthea/2024");
        assert_eq!(key_directory("bundle.json"), "");
        assert_eq!(key_directory("dir/"), "dir");
    }
}
