//! Per-stage checkpoints.
//!
//! Every streaming query owns one checkpoint directory:
//!
//! ```text
//! <checkpoints>/<stage>/
//!   metadata          query id, stable across restarts
//!   offsets/<batch>   planned input of a micro-batch (write-ahead)
//!   commits/<batch>   the micro-batch's output is committed
//!   state/<batch>     transform state after the micro-batch
//!   _schemas/<n>      inferred source schema history (ingest only)
//! ```
//!
//! `offsets/N` is always written before batch N is processed and
//! `commits/N` only after its output is committed, so an offset without a
//! commit marks a batch to replay. Log entries are written with
//! put-if-absent; a second writer on the same checkpoint fails instead of
//! silently interleaving.

pub mod state;

pub use state::{CommitEntry, OffsetEntry, QueryMetadata, Recovery};

use object_store::path::Path;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::prelude::*;
use tracing::{debug, info};

use medallion_core::StorageProviderRef;

use crate::error::{
    CheckpointError, CheckpointStorageSnafu, ConcurrentQuerySnafu, CorruptSnafu,
    SerializeCheckpointSnafu,
};
use crate::record::Schema;

const METADATA_FILE: &str = "metadata";
const OFFSETS_DIR: &str = "offsets";
const COMMITS_DIR: &str = "commits";
const STATE_DIR: &str = "state";
const SCHEMAS_DIR: &str = "_schemas";

/// Reader and writer for one stage checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointLog {
    storage: StorageProviderRef,
    root: Path,
    name: String,
}

impl CheckpointLog {
    /// Checkpoint in directory `dir` below the checkpoint root.
    pub fn new(storage: StorageProviderRef, dir: &str) -> Self {
        Self {
            storage,
            root: Path::from(dir),
            name: dir.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> String {
        self.storage.url_for(&self.root)
    }

    fn entry_path(&self, dir: &str, id: u64) -> Path {
        self.root.child(dir).child(id.to_string())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, CheckpointError> {
        let bytes = match self.storage.get(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => return Err(CheckpointError::CheckpointStorage { source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .context(CorruptSnafu {
                path: path.to_string(),
            })
    }

    async fn write_json_once<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec_pretty(value).context(SerializeCheckpointSnafu)?;
        match self.storage.put_if_absent(path, body).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => ConcurrentQuerySnafu {
                path: path.to_string(),
            }
            .fail(),
            Err(source) => Err(CheckpointError::CheckpointStorage { source }),
        }
    }

    /// Numeric entry ids in a log directory, ascending.
    async fn ids(&self, dir: &str) -> Result<Vec<u64>, CheckpointError> {
        let entries = self
            .storage
            .list(Some(&self.root.child(dir)))
            .await
            .context(CheckpointStorageSnafu)?;
        let mut ids: Vec<u64> = entries
            .iter()
            .filter_map(|entry| entry.path.filename())
            .filter_map(|name| name.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Load the query metadata, creating it on first use.
    pub async fn load_or_create_metadata(&self) -> Result<QueryMetadata, CheckpointError> {
        let path = self.root.child(METADATA_FILE);
        if let Some(metadata) = self.read_json(&path).await? {
            return Ok(metadata);
        }

        let metadata = QueryMetadata::new();
        self.write_json_once(&path, &metadata).await?;
        info!(
            target = %self.name,
            query_id = %metadata.id,
            "Created checkpoint"
        );
        Ok(metadata)
    }

    /// Every planned batch, ascending.
    pub async fn offsets(&self) -> Result<Vec<OffsetEntry>, CheckpointError> {
        let mut offsets = Vec::new();
        for id in self.ids(OFFSETS_DIR).await? {
            if let Some(entry) = self.read_json(&self.entry_path(OFFSETS_DIR, id)).await? {
                offsets.push(entry);
            }
        }
        Ok(offsets)
    }

    /// Record the planned input of a batch before processing it.
    pub async fn write_offset(&self, entry: &OffsetEntry) -> Result<(), CheckpointError> {
        self.write_json_once(&self.entry_path(OFFSETS_DIR, entry.batch_id), entry)
            .await?;
        debug!(target = %self.name, batch_id = entry.batch_id, "Wrote offset");
        Ok(())
    }

    /// Highest batch with a commit marker.
    pub async fn last_committed(&self) -> Result<Option<u64>, CheckpointError> {
        Ok(self.ids(COMMITS_DIR).await?.last().copied())
    }

    pub async fn read_commit(&self, batch_id: u64) -> Result<Option<CommitEntry>, CheckpointError> {
        self.read_json(&self.entry_path(COMMITS_DIR, batch_id)).await
    }

    /// Mark a batch as finished.
    pub async fn write_commit(&self, entry: &CommitEntry) -> Result<(), CheckpointError> {
        self.write_json_once(&self.entry_path(COMMITS_DIR, entry.batch_id), entry)
            .await?;
        debug!(target = %self.name, batch_id = entry.batch_id, "Wrote commit");
        Ok(())
    }

    /// Save transform state as of a batch. A replayed batch overwrites it.
    pub async fn write_state(&self, batch_id: u64, state: &serde_json::Value) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec(state).context(SerializeCheckpointSnafu)?;
        self.storage
            .atomic_write(&self.entry_path(STATE_DIR, batch_id), body)
            .await
            .context(CheckpointStorageSnafu)
    }

    pub async fn read_state(&self, batch_id: u64) -> Result<Option<serde_json::Value>, CheckpointError> {
        self.read_json(&self.entry_path(STATE_DIR, batch_id)).await
    }

    /// Newest recorded source schema and its id.
    pub async fn latest_schema(&self) -> Result<Option<(u64, Schema)>, CheckpointError> {
        let Some(id) = self.ids(SCHEMAS_DIR).await?.last().copied() else {
            return Ok(None);
        };
        let schema = self.read_json(&self.entry_path(SCHEMAS_DIR, id)).await?;
        Ok(schema.map(|schema| (id, schema)))
    }

    /// Record a new source schema under the given id.
    pub async fn write_schema(&self, id: u64, schema: &Schema) -> Result<(), CheckpointError> {
        self.write_json_once(&self.entry_path(SCHEMAS_DIR, id), schema)
            .await?;
        info!(
            target = %self.name,
            schema_id = id,
            columns = schema.fields().len(),
            "Recorded source schema"
        );
        Ok(())
    }

    /// Read everything a restarting query needs.
    pub async fn recover(&self) -> Result<Recovery, CheckpointError> {
        let metadata = self.load_or_create_metadata().await?;
        let offsets = self.offsets().await?;
        let last_committed = self.last_committed().await?;

        let recovery = Recovery {
            metadata,
            offsets,
            last_committed,
        };
        if let Some(pending) = recovery.pending() {
            info!(
                target = %self.name,
                batch_id = pending.batch_id,
                "Found uncommitted batch, it will be replayed"
            );
        }
        Ok(recovery)
    }

    /// Delete the whole checkpoint. Returns the number of files removed.
    pub async fn delete(&self) -> Result<usize, CheckpointError> {
        self.storage
            .delete_prefix(&self.root)
            .await
            .context(CheckpointStorageSnafu)
    }
}
