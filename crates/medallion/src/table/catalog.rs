//! Name-based table lookup under a warehouse root.

use object_store::path::Path;
use snafu::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use medallion_core::{StorageProvider, StorageProviderRef};

use super::{LOG_DIR, Table};
use crate::error::{CatalogSnafu, TableError};

/// Resolves tables by name below one warehouse URL.
#[derive(Debug, Clone)]
pub struct Catalog {
    storage: StorageProviderRef,
}

impl Catalog {
    /// Open the warehouse at `url`, creating it if needed.
    pub async fn open(url: &str) -> Result<Self, TableError> {
        let storage = StorageProvider::for_url(url)
            .await
            .context(CatalogSnafu { url })?;
        Ok(Self::from_storage(Arc::new(storage)))
    }

    pub fn from_storage(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    pub fn url(&self) -> &str {
        self.storage.canonical_url()
    }

    /// Handle to the named table. The table need not exist yet.
    pub fn table(&self, name: &str) -> Table {
        Table::new(name, self.storage.clone())
    }

    pub async fn exists(&self, name: &str) -> Result<bool, TableError> {
        self.table(name).exists().await
    }

    /// Names of every table with at least one commit, sorted.
    pub async fn list_tables(&self) -> Result<Vec<String>, TableError> {
        let entries = self
            .storage
            .list(None)
            .await
            .context(CatalogSnafu { url: self.url() })?;

        let names: BTreeSet<String> = entries
            .iter()
            .filter_map(|entry| {
                let parts: Vec<_> = entry.path.parts().collect();
                match parts.as_slice() {
                    [table, log, file]
                        if log.as_ref() == LOG_DIR && file.as_ref().ends_with(".json") =>
                    {
                        Some(table.as_ref().to_string())
                    }
                    _ => None,
                }
            })
            .collect();
        Ok(names.into_iter().collect())
    }

    /// Delete a table and all of its files. Dropping a missing table is a
    /// no-op. Returns whether anything was deleted.
    pub async fn drop_table(&self, name: &str) -> Result<bool, TableError> {
        let deleted = self
            .storage
            .delete_prefix(&Path::from(name))
            .await
            .context(CatalogSnafu { url: self.url() })?;
        if deleted > 0 {
            info!(table = name, files = deleted, "Dropped table");
        }
        Ok(deleted > 0)
    }
}
