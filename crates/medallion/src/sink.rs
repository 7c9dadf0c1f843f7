//! Exactly-once micro-batch writes into a table.
//!
//! Every commit carries a `txn` action naming the writing query and the
//! micro-batch. Before writing, the sink looks up the last batch the query
//! committed to the table; a batch at or below it is a replay of work that
//! already landed and is skipped.

use indexmap::IndexMap;
use snafu::prelude::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

use medallion_core::emit;
use medallion_core::metrics::events::{BatchSkipped, RecordsWritten};

use crate::error::{SchemaMismatchSnafu, TableError};
use crate::record::Record;
use crate::source::Batch;
use crate::table::actions::{
    create_add_action, create_metadata_action, create_remove_action, create_txn_action,
};
use crate::table::{Operation, Table};

/// How a micro-batch changes the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Rows are added to the table.
    Append,
    /// Rows replace the whole table.
    Complete,
}

impl OutputMode {
    fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Append => "Append",
            OutputMode::Complete => "Complete",
        }
    }
}

/// Outcome of one sink write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkCommit {
    /// Table version written, `None` when the write was skipped.
    pub version: Option<u64>,
    pub records: u64,
    pub skipped: bool,
}

/// Writes the micro-batches of one query into a table.
#[derive(Debug, Clone)]
pub struct TableSink {
    table: Table,
    mode: OutputMode,
    app_id: String,
    target: String,
}

impl TableSink {
    /// `app_id` identifies the writing query and must be stable across
    /// restarts.
    pub fn new(
        table: Table,
        mode: OutputMode,
        app_id: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            table,
            mode,
            app_id: app_id.into(),
            target: target.into(),
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Commit a micro-batch.
    ///
    /// Rows are grouped into one data file per origin so every file keeps
    /// the file it was originally read from. An empty append batch still
    /// commits, recording the batch as done.
    pub async fn write(&self, batch_id: u64, batch: &Batch) -> Result<SinkCommit, TableError> {
        let snapshot = self.table.snapshot().await?;

        if let Some(committed) = snapshot.txn_version(&self.app_id)
            && committed >= batch_id
        {
            info!(
                target = %self.target,
                table = self.table.name(),
                batch_id,
                committed,
                "Batch already committed to table, skipping write"
            );
            emit!(BatchSkipped {
                batch_id,
                target: self.target.clone(),
            });
            return Ok(SinkCommit {
                version: None,
                records: 0,
                skipped: true,
            });
        }

        let mut actions = Vec::new();
        let schema = match snapshot.schema() {
            Some(current) => {
                let merged = current.merge(&batch.schema).map_err(|message| {
                    SchemaMismatchSnafu {
                        table: self.table.name(),
                        message,
                    }
                    .build()
                })?;
                if &merged != current {
                    debug!(table = self.table.name(), "Table schema evolved");
                    actions.push(create_metadata_action(
                        &Uuid::new_v4().to_string(),
                        merged.clone(),
                    ));
                }
                merged
            }
            None => {
                ensure!(
                    !batch.schema.fields().is_empty() || batch.is_empty(),
                    SchemaMismatchSnafu {
                        table: self.table.name(),
                        message: "batch has rows but no columns",
                    }
                );
                if !batch.schema.fields().is_empty() {
                    actions.push(create_metadata_action(
                        &Uuid::new_v4().to_string(),
                        batch.schema.clone(),
                    ));
                }
                batch.schema.clone()
            }
        };

        if self.mode == OutputMode::Complete {
            actions.extend(snapshot.files().map(|add| create_remove_action(&add.path)));
        }

        let mut by_origin: IndexMap<Option<&str>, Vec<&Record>> = IndexMap::new();
        for row in &batch.rows {
            by_origin
                .entry(row.origin.as_deref())
                .or_default()
                .push(&row.record);
        }
        for (origin, records) in by_origin {
            let (path, size) = self
                .table
                .write_data_file(batch_id, &schema, &records)
                .await?;
            actions.push(create_add_action(
                &path,
                size,
                records.len() as u64,
                origin.map(str::to_string),
            ));
        }
        actions.push(create_txn_action(&self.app_id, batch_id));

        let operation = Operation::StreamingUpdate {
            output_mode: self.mode.as_str(),
            query_id: self.app_id.clone(),
            epoch_id: batch_id,
        };
        let version = self
            .table
            .commit(snapshot.version(), operation, actions)
            .await?;

        if self.mode == OutputMode::Complete
            && let Err(e) = self.table.remove_unreferenced_files().await
        {
            warn!(
                target = %self.target,
                table = self.table.name(),
                error = %e,
                "Failed to remove replaced data files"
            );
        }

        let records = batch.len() as u64;
        emit!(RecordsWritten {
            count: records,
            target: self.target.clone(),
        });
        debug!(
            target = %self.target,
            table = self.table.name(),
            batch_id,
            version,
            records,
            "Committed batch to table"
        );
        Ok(SinkCommit {
            version: Some(version),
            records,
            skipped: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DataType, Field, Row, Schema, Value};
    use crate::table::Catalog;
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64),
            Field::new("state", DataType::String),
        ])
    }

    fn row(id: i64, state: &str, origin: &str) -> Row {
        let mut record = Record::new();
        record.insert("id".to_string(), Value::Int64(id));
        record.insert("state".to_string(), Value::String(state.to_string()));
        Row::new(record, Some(origin.to_string()))
    }

    async fn catalog(dir: &TempDir) -> Catalog {
        Catalog::open(dir.path().to_str().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_append_groups_rows_by_origin() {
        let dir = TempDir::new().unwrap();
        let table = catalog(&dir).await.table("bronze");
        let sink = TableSink::new(table.clone(), OutputMode::Append, "q1", "ingest");

        let batch = Batch::new(
            schema(),
            vec![
                row(1, "CA", "file:///a.csv"),
                row(2, "NY", "file:///b.csv"),
                row(3, "CA", "file:///a.csv"),
            ],
        );
        let commit = sink.write(0, &batch).await.unwrap();
        assert_eq!(commit.version, Some(0));
        assert_eq!(commit.records, 3);

        let snapshot = table.snapshot().await.unwrap();
        assert_eq!(snapshot.num_files(), 2);
        assert_eq!(snapshot.num_records(), 3);
        assert_eq!(snapshot.txn_version("q1"), Some(0));
        let origins: Vec<_> = snapshot
            .files()
            .map(|add| add.source_file.clone().unwrap())
            .collect();
        assert_eq!(origins, vec!["file:///a.csv", "file:///b.csv"]);
    }

    #[tokio::test]
    async fn test_replayed_batch_is_skipped() {
        let dir = TempDir::new().unwrap();
        let table = catalog(&dir).await.table("bronze");
        let sink = TableSink::new(table.clone(), OutputMode::Append, "q1", "ingest");
        let batch = Batch::new(schema(), vec![row(1, "CA", "a")]);

        sink.write(0, &batch).await.unwrap();
        let replay = sink.write(0, &batch).await.unwrap();

        assert!(replay.skipped);
        assert_eq!(replay.version, None);
        assert_eq!(table.snapshot().await.unwrap().num_records(), 1);

        let next = sink.write(1, &batch).await.unwrap();
        assert_eq!(next.version, Some(1));
        assert_eq!(table.snapshot().await.unwrap().num_records(), 2);
    }

    #[tokio::test]
    async fn test_other_query_is_not_skipped() {
        let dir = TempDir::new().unwrap();
        let table = catalog(&dir).await.table("bronze");
        let batch = Batch::new(schema(), vec![row(1, "CA", "a")]);

        TableSink::new(table.clone(), OutputMode::Append, "q1", "ingest")
            .write(0, &batch)
            .await
            .unwrap();
        let other = TableSink::new(table.clone(), OutputMode::Append, "q2", "ingest")
            .write(0, &batch)
            .await
            .unwrap();

        assert!(!other.skipped);
        assert_eq!(table.snapshot().await.unwrap().num_records(), 2);
    }

    #[tokio::test]
    async fn test_complete_mode_replaces_table() {
        let dir = TempDir::new().unwrap();
        let table = catalog(&dir).await.table("gold");
        let sink = TableSink::new(table.clone(), OutputMode::Complete, "q1", "aggregate");

        sink.write(0, &Batch::new(schema(), vec![row(1, "CA", "a"), row(2, "NY", "a")]))
            .await
            .unwrap();
        sink.write(1, &Batch::new(schema(), vec![row(3, "CA", "b")]))
            .await
            .unwrap();

        let snapshot = table.snapshot().await.unwrap();
        assert_eq!(snapshot.num_files(), 1);
        let rows = table.read_rows(&snapshot).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), &Value::Int64(3));
    }

    #[tokio::test]
    async fn test_complete_mode_removes_replaced_files() {
        let dir = TempDir::new().unwrap();
        let table = catalog(&dir).await.table("gold");
        let sink = TableSink::new(table.clone(), OutputMode::Complete, "q1", "aggregate");

        for batch_id in 0..4 {
            sink.write(
                batch_id,
                &Batch::new(schema(), vec![row(batch_id as i64, "CA", "a")]),
            )
            .await
            .unwrap();
        }

        let data_files = std::fs::read_dir(dir.path().join("gold"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name.to_string_lossy().starts_with("part-"))
            .count();
        // The active file plus the one the latest version replaced.
        assert_eq!(data_files, 2);

        let rows = table.read_rows(&table.snapshot().await.unwrap()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), &Value::Int64(3));
    }

    #[tokio::test]
    async fn test_schema_evolves_with_new_columns() {
        let dir = TempDir::new().unwrap();
        let table = catalog(&dir).await.table("bronze");
        let sink = TableSink::new(table.clone(), OutputMode::Append, "q1", "ingest");
        sink.write(0, &Batch::new(schema(), vec![row(1, "CA", "a")]))
            .await
            .unwrap();

        let mut wider = schema();
        wider.upsert(Field::new("email", DataType::String));
        let mut r = row(2, "NY", "b");
        r.record
            .insert("email".to_string(), Value::String("x@y.z".to_string()));
        sink.write(1, &Batch::new(wider, vec![r])).await.unwrap();

        let snapshot = table.snapshot().await.unwrap();
        let names: Vec<_> = snapshot.schema().unwrap().names().collect();
        assert_eq!(names, vec!["id", "state", "email"]);

        let rows = table.read_rows(&snapshot).await.unwrap();
        assert_eq!(rows[0].get("email"), &Value::Null);
    }

    #[tokio::test]
    async fn test_conflicting_types_rejected() {
        let dir = TempDir::new().unwrap();
        let table = catalog(&dir).await.table("bronze");
        let sink = TableSink::new(table.clone(), OutputMode::Append, "q1", "ingest");
        sink.write(0, &Batch::new(schema(), vec![row(1, "CA", "a")]))
            .await
            .unwrap();

        let conflicting = Schema::new(vec![Field::new("id", DataType::String)]);
        let err = sink
            .write(1, &Batch::new(conflicting, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn test_empty_batch_records_txn() {
        let dir = TempDir::new().unwrap();
        let table = catalog(&dir).await.table("silver");
        let sink = TableSink::new(table.clone(), OutputMode::Append, "q1", "cleanse");

        let commit = sink.write(0, &Batch::default()).await.unwrap();
        assert_eq!(commit.version, Some(0));

        let snapshot = table.snapshot().await.unwrap();
        assert!(snapshot.schema().is_none());
        assert_eq!(snapshot.txn_version("q1"), Some(0));
    }
}
