//! Local filesystem storage backend implementation.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use snafu::prelude::*;
use std::sync::Arc;

use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

/// Local filesystem configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
}

impl StorageProvider {
    pub(super) async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path)
            .await
            .context(IoSnafu)?;
        let root = tokio::fs::canonicalize(&config.path)
            .await
            .context(IoSnafu)?;

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(LocalFileSystem::new_with_prefix(&root).context(ObjectStoreSnafu)?);

        let canonical_url = format!("file://{}", root.display());

        Ok(Self {
            config: BackendConfig::Local(LocalConfig {
                path: root.display().to_string(),
            }),
            object_store,
            canonical_url,
        })
    }

    /// Remove a directory below the local root, ignoring a missing one.
    pub(super) async fn remove_local_dir(
        &self,
        local: &LocalConfig,
        prefix: &Path,
    ) -> Result<(), StorageError> {
        let mut dir = std::path::PathBuf::from(&local.path);
        dir.extend(prefix.parts().map(|part| part.as_ref().to_string()));

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { source }),
        }
    }
}
