//! Transactional tables.
//!
//! A table is a directory of newline-delimited JSON data files plus a log
//! under `_log/`. Each log entry `<version:020>.json` is written with a
//! put-if-absent, so two writers can never produce the same version: the
//! loser gets [`TableError::CommitConflict`] and must re-read the table.
//!
//! Replaying the log yields a [`Snapshot`]: the active data files, the
//! current schema and, per streaming writer, the last committed micro-batch.
//! Every [`CHECKPOINT_INTERVAL`] versions the snapshot is also written as
//! `<version:020>.checkpoint.json`, so replay starts from the latest
//! checkpoint instead of version 0.

pub mod actions;
mod catalog;

pub use actions::Action;
pub use catalog::Catalog;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use medallion_core::StorageProviderRef;
use medallion_core::emit;
use medallion_core::metrics::events::{CommitDuration, TableVersion};

use crate::error::{
    CommitConflictSnafu, DecodeDataSnafu, ParseCheckpointSnafu, ParseLogSnafu, SerializeSnafu,
    TableError, TableNotFoundSnafu, TableStorageSnafu,
};
use crate::record::{Record, Row, Schema, decode_record, encode_record};
use actions::{Add, MetaData, Txn, create_commit_info, decode_actions, encode_actions};

const LOG_DIR: &str = "_log";
const COMMIT_SUFFIX: &str = ".json";
const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";
const DATA_FILE_PREFIX: &str = "part-";

/// Versions between two log checkpoints.
pub const CHECKPOINT_INTERVAL: u64 = 10;

/// The kind of change a commit makes, recorded in its `commitInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A streaming micro-batch write.
    StreamingUpdate {
        output_mode: &'static str,
        query_id: String,
        epoch_id: u64,
    },
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::StreamingUpdate { .. } => "STREAMING UPDATE",
        }
    }

    fn parameters(&self) -> BTreeMap<String, String> {
        match self {
            Operation::StreamingUpdate {
                output_mode,
                query_id,
                epoch_id,
            } => BTreeMap::from([
                ("outputMode".to_string(), output_mode.to_string()),
                ("queryId".to_string(), query_id.clone()),
                ("epochId".to_string(), epoch_id.to_string()),
            ]),
        }
    }
}

/// State of a table at one version.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    version: Option<u64>,
    metadata: Option<MetaData>,
    files: IndexMap<String, Add>,
    app_versions: HashMap<String, Txn>,
}

impl Snapshot {
    fn apply(&mut self, version: u64, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::MetaData(metadata) => self.metadata = Some(metadata),
                Action::Add(add) => {
                    self.files.insert(add.path.clone(), add);
                }
                Action::Remove(remove) => {
                    self.files.shift_remove(&remove.path);
                }
                Action::Txn(txn) => {
                    let newer = self
                        .app_versions
                        .get(&txn.app_id)
                        .is_none_or(|current| current.version < txn.version);
                    if newer {
                        self.app_versions.insert(txn.app_id.clone(), txn);
                    }
                }
                Action::CommitInfo(_) => {}
            }
        }
        self.version = Some(version);
    }

    /// Version of the snapshot, `None` for a table without commits.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.metadata.as_ref().map(|metadata| &metadata.schema)
    }

    /// Active data files in the order they were added.
    pub fn files(&self) -> impl Iterator<Item = &Add> {
        self.files.values()
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn num_records(&self) -> u64 {
        self.files.values().map(|add| add.num_records).sum()
    }

    /// Last micro-batch committed by a streaming writer.
    pub fn txn_version(&self, app_id: &str) -> Option<u64> {
        self.app_versions.get(app_id).map(|txn| txn.version)
    }

    /// The actions that rebuild this snapshot from nothing.
    fn checkpoint_actions(&self) -> Vec<Action> {
        let mut txns: Vec<&Txn> = self.app_versions.values().collect();
        txns.sort_by(|a, b| a.app_id.cmp(&b.app_id));

        self.metadata
            .iter()
            .cloned()
            .map(Action::MetaData)
            .chain(self.files.values().cloned().map(Action::Add))
            .chain(txns.into_iter().cloned().map(Action::Txn))
            .collect()
    }
}

/// Commit versions and checkpoint versions found under `_log/`, ascending.
#[derive(Debug, Default)]
struct LogListing {
    commits: Vec<u64>,
    checkpoints: Vec<u64>,
}

/// The actions of one committed version.
#[derive(Debug, Clone)]
pub struct TableCommit {
    pub version: u64,
    pub actions: Vec<Action>,
}

/// One line of a table's history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub version: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub operation: String,
    pub parameters: BTreeMap<String, String>,
    pub added_files: usize,
    pub removed_files: usize,
    pub added_records: u64,
}

/// Handle to a table below the warehouse root.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    storage: StorageProviderRef,
    root: Path,
}

impl Table {
    pub(crate) fn new(name: &str, storage: StorageProviderRef) -> Self {
        Self {
            name: name.to_string(),
            root: Path::from(name),
            storage,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// URL of the table root.
    pub fn url(&self) -> String {
        self.storage.url_for(&self.root)
    }

    /// URL of a data file of this table.
    pub fn file_url(&self, path: &str) -> String {
        self.storage.url_for(&self.root.child(path))
    }

    fn log_path(&self, version: u64) -> Path {
        self.root
            .child(LOG_DIR)
            .child(format!("{version:020}{COMMIT_SUFFIX}"))
    }

    fn checkpoint_path(&self, version: u64) -> Path {
        self.root
            .child(LOG_DIR)
            .child(format!("{version:020}{CHECKPOINT_SUFFIX}"))
    }

    async fn list_log(&self) -> Result<LogListing, TableError> {
        let entries = self
            .storage
            .list(Some(&self.root.child(LOG_DIR)))
            .await
            .context(TableStorageSnafu { table: &self.name })?;

        let mut listing = LogListing::default();
        for name in entries.iter().filter_map(|entry| entry.path.filename()) {
            if let Some(version) = name.strip_suffix(CHECKPOINT_SUFFIX) {
                listing.checkpoints.extend(version.parse::<u64>().ok());
            } else if let Some(version) = name.strip_suffix(COMMIT_SUFFIX) {
                listing.commits.extend(version.parse::<u64>().ok());
            }
        }
        listing.commits.sort_unstable();
        listing.checkpoints.sort_unstable();
        Ok(listing)
    }

    /// All committed versions, ascending.
    pub async fn versions(&self) -> Result<Vec<u64>, TableError> {
        Ok(self.list_log().await?.commits)
    }

    /// Latest committed version, `None` if the table does not exist.
    pub async fn latest_version(&self) -> Result<Option<u64>, TableError> {
        Ok(self.versions().await?.last().copied())
    }

    pub async fn exists(&self) -> Result<bool, TableError> {
        Ok(self.latest_version().await?.is_some())
    }

    /// Read the actions of one version.
    pub async fn read_commit(&self, version: u64) -> Result<Vec<Action>, TableError> {
        let bytes = self
            .storage
            .get(&self.log_path(version))
            .await
            .context(TableStorageSnafu { table: &self.name })?;
        decode_actions(&bytes).context(ParseLogSnafu {
            table: &self.name,
            version,
        })
    }

    /// Snapshot at the latest version.
    pub async fn snapshot(&self) -> Result<Snapshot, TableError> {
        self.snapshot_at(None).await
    }

    /// Snapshot at `version`, or at the latest version when `None`.
    ///
    /// Replay starts from the latest checkpoint at or below the target.
    pub async fn snapshot_at(&self, version: Option<u64>) -> Result<Snapshot, TableError> {
        let listing = self.list_log().await?;
        let mut snapshot = Snapshot::default();
        let Some(target) = version.or_else(|| listing.commits.last().copied()) else {
            return Ok(snapshot);
        };

        let checkpoint = listing
            .checkpoints
            .iter()
            .rev()
            .copied()
            .find(|v| *v <= target);
        if let Some(v) = checkpoint {
            let actions = self.read_checkpoint(v).await?;
            snapshot.apply(v, actions);
        }

        for v in listing
            .commits
            .into_iter()
            .filter(|v| checkpoint.is_none_or(|c| *v > c))
            .take_while(|v| *v <= target)
        {
            let actions = self.read_commit(v).await?;
            snapshot.apply(v, actions);
        }
        Ok(snapshot)
    }

    async fn read_checkpoint(&self, version: u64) -> Result<Vec<Action>, TableError> {
        let bytes = self
            .storage
            .get(&self.checkpoint_path(version))
            .await
            .context(TableStorageSnafu { table: &self.name })?;
        decode_actions(&bytes).context(ParseCheckpointSnafu {
            table: &self.name,
            version,
        })
    }

    /// Write the snapshot at `version` as a log checkpoint.
    pub async fn write_checkpoint(&self, version: u64) -> Result<(), TableError> {
        let snapshot = self.snapshot_at(Some(version)).await?;
        let body = encode_actions(&snapshot.checkpoint_actions()).context(SerializeSnafu)?;
        self.storage
            .put(&self.checkpoint_path(version), body)
            .await
            .context(TableStorageSnafu { table: &self.name })?;
        debug!(table = %self.name, version, files = snapshot.num_files(), "Wrote log checkpoint");
        Ok(())
    }

    /// Delete data files that no longer belong to the table.
    ///
    /// Files the latest version removes are kept for one more version, so a
    /// reader holding the previous snapshot can still finish. Returns the
    /// number of files deleted.
    pub async fn remove_unreferenced_files(&self) -> Result<usize, TableError> {
        let snapshot = self.snapshot().await?;
        let Some(version) = snapshot.version() else {
            return Ok(0);
        };
        let mut keep: HashSet<String> = snapshot.files().map(|add| add.path.clone()).collect();
        for action in self.read_commit(version).await? {
            if let Action::Remove(remove) = action {
                keep.insert(remove.path);
            }
        }

        let entries = self
            .storage
            .list(Some(&self.root))
            .await
            .context(TableStorageSnafu { table: &self.name })?;
        let depth = self.root.parts().count() + 1;
        let mut deleted = 0;
        for entry in entries {
            let Some(name) = entry.path.filename() else {
                continue;
            };
            if entry.path.parts().count() != depth
                || !name.starts_with(DATA_FILE_PREFIX)
                || keep.contains(name)
            {
                continue;
            }
            match self.storage.delete(&entry.path).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(source) => {
                    return Err(TableError::TableStorage {
                        table: self.name.clone(),
                        source,
                    });
                }
            }
        }
        if deleted > 0 {
            debug!(table = %self.name, version, deleted, "Removed unreferenced data files");
        }
        Ok(deleted)
    }

    /// Actions of every version in `from..=to`.
    pub async fn changes(&self, from: u64, to: u64) -> Result<Vec<TableCommit>, TableError> {
        let mut commits = Vec::new();
        for version in from..=to {
            commits.push(TableCommit {
                version,
                actions: self.read_commit(version).await?,
            });
        }
        Ok(commits)
    }

    /// Commit actions on top of `read_version`.
    ///
    /// A `commitInfo` action describing `operation` is written first. Returns
    /// the new version.
    pub async fn commit(
        &self,
        read_version: Option<u64>,
        operation: Operation,
        actions: Vec<Action>,
    ) -> Result<u64, TableError> {
        let start = Instant::now();
        let version = read_version.map_or(0, |v| v + 1);

        let mut entry = Vec::with_capacity(actions.len() + 1);
        entry.push(create_commit_info(
            operation.name(),
            operation.parameters(),
            read_version,
        ));
        entry.extend(actions);
        let body = encode_actions(&entry).context(SerializeSnafu)?;

        match self.storage.put_if_absent(&self.log_path(version), body).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                return CommitConflictSnafu {
                    table: &self.name,
                    version,
                }
                .fail();
            }
            Err(source) => {
                return Err(TableError::TableStorage {
                    table: self.name.clone(),
                    source,
                });
            }
        }

        emit!(CommitDuration {
            duration: start.elapsed(),
            target: self.name.clone(),
        });
        emit!(TableVersion {
            version: version as i64,
            target: self.name.clone(),
        });
        debug!(table = %self.name, version, "Committed table version");

        if version > 0
            && version % CHECKPOINT_INTERVAL == 0
            && let Err(e) = self.write_checkpoint(version).await
        {
            warn!(table = %self.name, version, error = %e, "Failed to write log checkpoint");
        }
        Ok(version)
    }

    /// Write records to a new data file. Returns the file path and size.
    pub async fn write_data_file(
        &self,
        batch_id: u64,
        schema: &Schema,
        records: &[&Record],
    ) -> Result<(String, u64), TableError> {
        let file_name = format!("{DATA_FILE_PREFIX}{batch_id:05}-{}.ndjson", Uuid::new_v4());

        let mut body = String::new();
        for record in records {
            let line =
                serde_json::to_string(&encode_record(record, schema)).context(SerializeSnafu)?;
            body.push_str(&line);
            body.push('\n');
        }
        let size = body.len() as u64;

        self.storage
            .put(&self.root.child(file_name.as_str()), body)
            .await
            .context(TableStorageSnafu { table: &self.name })?;
        Ok((file_name, size))
    }

    /// Read the records of one data file.
    pub async fn read_file(&self, add: &Add, schema: &Schema) -> Result<Vec<Record>, TableError> {
        let bytes = self
            .storage
            .get(&self.root.child(add.path.as_str()))
            .await
            .context(TableStorageSnafu { table: &self.name })?;

        serde_json::Deserializer::from_slice(&bytes)
            .into_iter::<serde_json::Map<String, serde_json::Value>>()
            .map(|object| {
                object
                    .map(|object| decode_record(&object, schema))
                    .context(DecodeDataSnafu { path: &add.path })
            })
            .collect()
    }

    /// Read the rows of a data file, tagged with their origin.
    ///
    /// The origin is the file the rows were originally read from, or the
    /// data file itself when that is unknown.
    pub async fn read_rows_of(&self, add: &Add, schema: &Schema) -> Result<Vec<Row>, TableError> {
        let origin = add
            .source_file
            .clone()
            .unwrap_or_else(|| self.file_url(&add.path));
        Ok(self
            .read_file(add, schema)
            .await?
            .into_iter()
            .map(|record| Row::new(record, Some(origin.clone())))
            .collect())
    }

    /// Read every row of a snapshot.
    pub async fn read_rows(&self, snapshot: &Snapshot) -> Result<Vec<Row>, TableError> {
        let Some(schema) = snapshot.schema() else {
            return Ok(Vec::new());
        };
        let mut rows = Vec::with_capacity(snapshot.num_records() as usize);
        for add in snapshot.files() {
            rows.extend(self.read_rows_of(add, schema).await?);
        }
        Ok(rows)
    }

    /// Commit history, oldest first.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>, TableError> {
        let versions = self.versions().await?;
        ensure!(
            !versions.is_empty(),
            TableNotFoundSnafu { table: &self.name }
        );
        let mut history = Vec::new();
        for version in versions {
            let actions = self.read_commit(version).await?;
            let mut entry = HistoryEntry {
                version,
                timestamp: None,
                operation: String::new(),
                parameters: BTreeMap::new(),
                added_files: 0,
                removed_files: 0,
                added_records: 0,
            };
            for action in actions {
                match action {
                    Action::CommitInfo(info) => {
                        entry.timestamp = DateTime::from_timestamp_millis(info.timestamp);
                        entry.operation = info.operation;
                        entry.parameters = info.operation_parameters;
                    }
                    Action::Add(add) => {
                        entry.added_files += 1;
                        entry.added_records += add.num_records;
                    }
                    Action::Remove(_) => entry.removed_files += 1,
                    Action::MetaData(_) | Action::Txn(_) => {}
                }
            }
            history.push(entry);
        }
        Ok(history)
    }
}
