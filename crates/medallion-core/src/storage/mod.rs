//! Object storage abstraction.
//!
//! Provides a unified interface over the local filesystem and a process-wide
//! in-memory store. Tables, checkpoints and source directories are all
//! addressed through a `StorageProvider` rooted at a URL.

mod local;
mod memory;
mod url_parser;

pub use local::LocalConfig;
pub use memory::MemoryConfig;
pub use url_parser::BackendConfig;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use snafu::prelude::*;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Metadata for a listed object, with its path relative to the provider root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub path: Path,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Storage provider that abstracts over the supported backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

fn record(operation: StorageOperation, status: RequestStatus, start: Instant) {
    emit!(StorageRequest { operation, status });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL.
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory(config) => Ok(Self::construct_memory(config)),
        }
    }

    /// Canonical URL of the provider root (e.g. `file:///data/customers`).
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Fully qualified URL for a path relative to the provider root.
    pub fn url_for(&self, path: &Path) -> String {
        format!("{}/{}", self.canonical_url.trim_end_matches('/'), path)
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(path)).await;
        record(StorageOperation::Get, RequestStatus::of(&result), start);

        result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)
    }

    /// Put bytes to a path, replacing any existing object.
    pub async fn put(&self, path: &Path, bytes: impl Into<Bytes>) -> Result<(), StorageError> {
        self.put_with_mode(path, bytes.into(), PutMode::Overwrite)
            .await
    }

    /// Put bytes to a path only if nothing exists there yet.
    ///
    /// Losing the race surfaces as an error for which
    /// [`StorageError::is_already_exists`] returns true.
    pub async fn put_if_absent(
        &self,
        path: &Path,
        bytes: impl Into<Bytes>,
    ) -> Result<(), StorageError> {
        self.put_with_mode(path, bytes.into(), PutMode::Create).await
    }

    async fn put_with_mode(
        &self,
        path: &Path,
        bytes: Bytes,
        mode: PutMode,
    ) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let opts = PutOptions {
            mode,
            ..Default::default()
        };
        let start = Instant::now();
        let result = self
            .object_store
            .put_opts(&path, PutPayload::from(bytes), opts)
            .await;
        record(StorageOperation::Put, RequestStatus::of(&result), start);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Atomically write content to a path using temp file + rename.
    ///
    /// 1. Write to `{path}.tmp`
    /// 2. Rename `{path}.tmp` to `{path}`
    ///
    /// If the write or rename fails, the original file (if any) is unchanged.
    pub async fn atomic_write(
        &self,
        path: &Path,
        content: impl Into<Bytes>,
    ) -> Result<(), StorageError> {
        let temp_path = Path::from(format!("{path}.tmp"));
        self.put(&temp_path, content).await?;
        self.rename(&temp_path, path).await
    }

    /// Rename (move) an object.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let from_qualified = self.qualify_path(from);
        let to_qualified = self.qualify_path(to);
        let start = Instant::now();
        let result = self
            .object_store
            .rename(&from_qualified, &to_qualified)
            .await;
        record(StorageOperation::Rename, RequestStatus::of(&result), start);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// List objects under a prefix (relative to the provider root), recursively.
    ///
    /// Returned paths are relative to the provider root and sorted.
    /// A missing prefix lists as empty.
    pub async fn list(&self, prefix: Option<&Path>) -> Result<Vec<ObjectEntry>, StorageError> {
        let full_prefix: Option<Path> = match (self.config.key(), prefix) {
            (Some(key), Some(prefix)) => Some(key.parts().chain(prefix.parts()).collect()),
            (Some(key), None) => Some(key.clone()),
            (None, Some(prefix)) => Some(prefix.clone()),
            (None, None) => None,
        };
        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let start = Instant::now();
        let mut stream = self.object_store.list(full_prefix.as_ref());
        let mut entries = Vec::new();
        let mut status = RequestStatus::Success;

        while let Some(result) = stream.next().await {
            match result {
                Ok(meta) => {
                    // Strip the key prefix so callers get relative paths
                    let path: Path = meta.location.parts().skip(key_part_count).collect();
                    entries.push(ObjectEntry {
                        path,
                        size: meta.size as u64,
                        last_modified: meta.last_modified,
                    });
                }
                Err(object_store::Error::NotFound { .. }) => {
                    debug!(prefix = ?full_prefix, "Prefix not found, listing as empty");
                }
                Err(source) => {
                    status = RequestStatus::Error;
                    record(StorageOperation::List, status, start);
                    return Err(StorageError::ObjectStore { source });
                }
            }
        }
        record(StorageOperation::List, status, start);

        entries.sort_by(|a, b| a.path.as_ref().cmp(b.path.as_ref()));
        Ok(entries)
    }

    /// Delete the object at the given path.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.delete(&path).await;
        record(StorageOperation::Delete, RequestStatus::of(&result), start);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete everything under a prefix. A missing prefix is a no-op.
    ///
    /// On the local filesystem the directory itself is removed too, so no
    /// empty directories are left behind.
    pub async fn delete_prefix(&self, prefix: &Path) -> Result<usize, StorageError> {
        let entries = self.list(Some(prefix)).await?;
        let mut deleted = 0;
        for entry in &entries {
            match self.delete(&entry.path).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if let BackendConfig::Local(local) = &self.config {
            self.remove_local_dir(local, prefix).await?;
        }

        debug!(
            url = %self.url_for(prefix),
            deleted,
            "Deleted prefix"
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn local_storage(temp_dir: &TempDir) -> StorageProvider {
        StorageProvider::for_url(temp_dir.path().to_str().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_returns_relative_sorted_paths() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("region=west");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("b.csv"), b"b").unwrap();
        std::fs::write(nested.join("a.csv"), b"a").unwrap();

        let storage = local_storage(&temp_dir).await;
        let entries = storage.list(None).await.unwrap();
        let paths: Vec<String> = entries.iter().map(|e| e.path.to_string()).collect();

        assert_eq!(paths, vec!["region=west/a.csv", "region=west/b.csv"]);
        assert_eq!(entries[0].size, 1);
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir).await;

        let entries = storage.list(Some(&Path::from("missing"))).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_put_if_absent_rejects_second_writer() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir).await;
        let path = Path::from("_log/00000000000000000000.json");

        storage.put_if_absent(&path, "first").await.unwrap();
        let err = storage.put_if_absent(&path, "second").await.unwrap_err();

        assert!(err.is_already_exists());
        assert_eq!(storage.get(&path).await.unwrap().as_ref(), b"first");
    }

    #[tokio::test]
    async fn test_atomic_write_overwrites_and_cleans_temp() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("metadata"), b"old").unwrap();
        let storage = local_storage(&temp_dir).await;

        storage
            .atomic_write(&Path::from("metadata"), "new")
            .await
            .unwrap();

        assert_eq!(
            storage.get(&Path::from("metadata")).await.unwrap().as_ref(),
            b"new"
        );
        assert!(!temp_dir.path().join("metadata.tmp").exists());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir).await;

        let err = storage.get(&Path::from("nope.json")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_prefix_removes_directory() {
        let temp_dir = TempDir::new().unwrap();
        let table_dir = temp_dir.path().join("bronze").join("_log");
        std::fs::create_dir_all(&table_dir).unwrap();
        std::fs::write(table_dir.join("0.json"), b"{}").unwrap();
        std::fs::write(temp_dir.path().join("bronze").join("part-0.ndjson"), b"{}").unwrap();

        let storage = local_storage(&temp_dir).await;
        let deleted = storage.delete_prefix(&Path::from("bronze")).await.unwrap();

        assert_eq!(deleted, 2);
        assert!(!temp_dir.path().join("bronze").exists());
    }

    #[tokio::test]
    async fn test_delete_prefix_missing_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir).await;

        let deleted = storage.delete_prefix(&Path::from("gone")).await.unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn test_url_for_joins_root() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_storage(&temp_dir).await;

        let url = storage.url_for(&Path::from("a/b.csv"));
        assert!(url.starts_with("file:///"));
        assert!(url.ends_with("/a/b.csv"));
    }

    #[tokio::test]
    async fn test_memory_providers_share_named_store() {
        let writer = StorageProvider::for_url("memory://storage-share-test/tables")
            .await
            .unwrap();
        let reader = StorageProvider::for_url("memory://storage-share-test")
            .await
            .unwrap();

        writer.put(&Path::from("t/x.json"), "x").await.unwrap();

        let entries = reader.list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path.to_string(), "tables/t/x.json");
    }
}
