//! Streaming reads of an append-only table.

use async_trait::async_trait;
use snafu::prelude::*;
use tracing::debug;

use medallion_core::emit;
use medallion_core::metrics::events::RecordsRead;

use super::{Batch, Source, SourceOffset};
use crate::checkpoint::OffsetEntry;
use crate::error::{NonAppendChangeSnafu, OffsetKindSnafu, SourceError, UpstreamSnafu};
use crate::table::{Action, Table};

/// New commits of an upstream table.
///
/// Offsets are table versions. Each batch holds the rows added by every
/// version after the previous batch; a version that removes data cannot be
/// followed and fails the read.
pub struct TableSource {
    name: String,
    table: Table,
}

impl TableSource {
    pub fn new(name: impl Into<String>, table: Table) -> Self {
        Self {
            name: name.into(),
            table,
        }
    }

    fn version_of(&self, offset: &SourceOffset) -> Result<u64, SourceError> {
        match offset {
            SourceOffset::Table { version } => Ok(*version),
            other => OffsetKindSnafu {
                source_name: &self.name,
                kind: other.kind(),
            }
            .fail(),
        }
    }
}

#[async_trait]
impl Source for TableSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recover(&mut self, _history: &[OffsetEntry]) -> Result<(), SourceError> {
        Ok(())
    }

    async fn plan(
        &mut self,
        committed: Option<&SourceOffset>,
    ) -> Result<Option<SourceOffset>, SourceError> {
        let Some(latest) = self.table.latest_version().await.context(UpstreamSnafu)? else {
            debug!(target = %self.name, table = self.table.name(), "Upstream table does not exist yet");
            return Ok(None);
        };
        let next = match committed {
            Some(offset) => self.version_of(offset)? + 1,
            None => 0,
        };
        Ok((latest >= next).then_some(SourceOffset::Table { version: latest }))
    }

    async fn read(
        &mut self,
        start: Option<&SourceOffset>,
        end: &SourceOffset,
    ) -> Result<Batch, SourceError> {
        let from = match start {
            Some(offset) => self.version_of(offset)? + 1,
            None => 0,
        };
        let to = self.version_of(end)?;

        let snapshot = self
            .table
            .snapshot_at(Some(to))
            .await
            .context(UpstreamSnafu)?;
        let schema = snapshot.schema().cloned().unwrap_or_default();

        let mut rows = Vec::new();
        if from <= to {
            for commit in self.table.changes(from, to).await.context(UpstreamSnafu)? {
                for action in &commit.actions {
                    match action {
                        Action::Add(add) if add.data_change => {
                            let added = self
                                .table
                                .read_rows_of(add, &schema)
                                .await
                                .context(UpstreamSnafu)?;
                            rows.extend(added);
                        }
                        Action::Remove(remove) if remove.data_change => {
                            return NonAppendChangeSnafu {
                                table: self.table.name(),
                                version: commit.version,
                            }
                            .fail();
                        }
                        _ => {}
                    }
                }
            }
        }

        emit!(RecordsRead {
            count: rows.len() as u64,
            target: self.name.clone(),
        });
        debug!(
            target = %self.name,
            from,
            to,
            rows = rows.len(),
            "Read table changes"
        );
        Ok(Batch::new(schema, rows))
    }

    async fn commit(&mut self, _end: &SourceOffset) -> Result<(), SourceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DataType, Field, Record, Schema, Value};
    use crate::table::actions::{create_add_action, create_metadata_action, create_remove_action};
    use crate::table::{Catalog, Operation};
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("postcode", DataType::Int64),
            Field::new("state", DataType::String),
        ])
    }

    fn op(epoch_id: u64) -> Operation {
        Operation::StreamingUpdate {
            output_mode: "Append",
            query_id: "upstream".to_string(),
            epoch_id,
        }
    }

    async fn append(table: &Table, postcode: i64, state: &str) -> u64 {
        let snapshot = table.snapshot().await.unwrap();
        let record = Record::from([
            ("postcode".to_string(), Value::Int64(postcode)),
            ("state".to_string(), Value::String(state.to_string())),
        ]);
        let (path, size) = table.write_data_file(0, &schema(), &[&record]).await.unwrap();
        let mut actions = Vec::new();
        if snapshot.version().is_none() {
            actions.push(create_metadata_action("id", schema()));
        }
        actions.push(create_add_action(
            &path,
            size,
            1,
            Some(format!("file:///in/{postcode}.csv")),
        ));
        table.commit(snapshot.version(), op(0), actions).await.unwrap()
    }

    async fn setup() -> (TempDir, Table, TableSource) {
        let temp_dir = TempDir::new().unwrap();
        let catalog = Catalog::open(temp_dir.path().to_str().unwrap())
            .await
            .unwrap();
        let table = catalog.table("bronze");
        let source = TableSource::new("cleanse", table.clone());
        (temp_dir, table, source)
    }

    #[tokio::test]
    async fn test_missing_upstream_plans_nothing() {
        let (_dir, _table, mut source) = setup().await;
        assert!(source.plan(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_only_new_versions() {
        let (_dir, table, mut source) = setup().await;
        append(&table, 0, "CA").await;
        append(&table, 12345, "CA").await;

        let first = source.plan(None).await.unwrap().unwrap();
        assert_eq!(first, SourceOffset::Table { version: 1 });
        let batch = source.read(None, &first).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.schema, schema());
        assert_eq!(batch.rows[1].origin.as_deref(), Some("file:///in/12345.csv"));

        assert!(source.plan(Some(&first)).await.unwrap().is_none());

        append(&table, 54321, "NY").await;
        let second = source.plan(Some(&first)).await.unwrap().unwrap();
        let batch = source.read(Some(&first), &second).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.rows[0].get("state"), &Value::String("NY".into()));
    }

    #[tokio::test]
    async fn test_replay_reads_the_same_rows() {
        let (_dir, table, mut source) = setup().await;
        append(&table, 1, "CA").await;
        append(&table, 2, "NY").await;

        let end = SourceOffset::Table { version: 1 };
        let first = source.read(None, &end).await.unwrap();
        append(&table, 3, "TX").await;
        let replay = source.read(None, &end).await.unwrap();

        assert_eq!(first.rows, replay.rows);
    }

    #[tokio::test]
    async fn test_removal_is_rejected() {
        let (_dir, table, mut source) = setup().await;
        append(&table, 1, "CA").await;
        let snapshot = table.snapshot().await.unwrap();
        let path = snapshot.files().next().unwrap().path.clone();
        table
            .commit(snapshot.version(), op(1), vec![create_remove_action(&path)])
            .await
            .unwrap();

        let end = source.plan(None).await.unwrap().unwrap();
        let err = source.read(None, &end).await.unwrap_err();
        assert!(matches!(err, SourceError::NonAppendChange { version: 1, .. }));
    }
}
