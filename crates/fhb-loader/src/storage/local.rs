//! Files below a local directory root, addressed like objects

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::BufReader;
use walkdir::WalkDir;

use super::{BoxedReader, ObjectSource, ObjectSummary};

/// Local directory tree; the bucket argument is ignored
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn walk(root: &Path, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut objects = Vec::new();

        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry =
                entry.with_context(|| format!("Failed to scan directory {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if !relative.starts_with(prefix) {
                continue;
            }

            let metadata = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            objects.push(ObjectSummary {
                key: relative,
                size: metadata.len() as i64,
                etag: Some(format!("{:x}-{:x}", modified, metadata.len())),
            });
        }

        Ok(objects)
    }
}

#[async_trait]
impl ObjectSource for LocalStorage {
    async fn open(&self, _bucket: &str, key: &str) -> Result<BoxedReader> {
        let path = self.root.join(key);
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::pin(BufReader::new(file)))
    }

    async fn list(&self, _bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || Self::walk(&root, &prefix))
            .await
            .context("Directory scan task failed")?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn test_list_and_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("synthea")).unwrap();
        std::fs::write(dir.path().join("synthea/a.ndjson"), "{\"resourceType\":\"Patient\"}\n").unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();

        let storage = LocalStorage::new(dir.path());
        let all = storage.list("", "").await.unwrap();
        let keys: Vec<_> = all.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["b.json", "synthea/a.ndjson"]);

        let scoped = storage.list("", "synthea/").await.unwrap();
        assert_eq!(scoped.len(), 1);

        let mut lines = storage.open("", "synthea/a.ndjson").await.unwrap().lines();
        let first = lines.next_line().await.unwrap().unwrap();
        assert!(first.contains("Patient"));
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(storage.open("", "nope.ndjson").await.is_err());
    }
}
