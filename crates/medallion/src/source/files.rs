//! Incremental file discovery for the ingest stage.
//!
//! Every listing is compared against the set of files already planned into
//! a batch. That set is rebuilt from the checkpoint offset log on restart,
//! so a file is ingested once no matter how often the directory is listed.

use async_trait::async_trait;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use medallion_core::StorageProviderRef;
use medallion_core::emit;
use medallion_core::metrics::events::{
    FileFailed, FilesDiscovered, RecordsDropped, RecordsRead, RecordsRescued, SchemaEvolved,
};

use super::delimited::{ParseOptions, RawFile, parse_records, read_raw};
use super::inference::SchemaInferrer;
use super::{Batch, Source, SourceFile, SourceOffset};
use crate::checkpoint::{CheckpointLog, OffsetEntry};
use crate::config::{IngestConfig, ParseMode, SchemaEvolutionMode};
use crate::error::{
    CsvSnafu, ListSnafu, OffsetKindSnafu, ReadFileSnafu, SchemaLogSnafu, SourceError,
    UnexpectedColumnsSnafu,
};
use crate::record::{DataType, Field, Row, Schema};

/// New files in a source directory, read as delimited text.
pub struct FileSource {
    name: String,
    storage: StorageProviderRef,
    schema_log: CheckpointLog,
    options: IngestConfig,
    seen: HashSet<String>,
    schema: Option<(u64, Schema)>,
}

impl FileSource {
    /// `schema_log` is the ingest checkpoint, which keeps the schema history.
    pub fn new(
        name: impl Into<String>,
        storage: StorageProviderRef,
        schema_log: CheckpointLog,
        options: IngestConfig,
    ) -> Self {
        Self {
            name: name.into(),
            storage,
            schema_log,
            options,
            seen: HashSet::new(),
            schema: None,
        }
    }

    /// Current source schema, including the rescued data column.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref().map(|(_, schema)| schema)
    }

    /// Whether a listed path is a source file: right extension, and no
    /// path component hidden with a leading `_` or `.`.
    fn is_candidate(&self, path: &Path) -> bool {
        let hidden = path
            .parts()
            .any(|part| part.as_ref().starts_with('_') || part.as_ref().starts_with('.'));
        let extension_matches = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.options.extension));
        !hidden && extension_matches
    }

    /// Unseen files in arrival order, oldest first.
    async fn list_unseen(&self) -> Result<Vec<SourceFile>, SourceError> {
        let entries = self.storage.list(None).await.context(ListSnafu)?;
        let mut files: Vec<SourceFile> = entries
            .into_iter()
            .filter(|entry| self.is_candidate(&entry.path))
            .filter(|entry| !self.seen.contains(entry.path.as_ref()))
            .map(|entry| SourceFile {
                path: entry.path.to_string(),
                size: entry.size,
                modified: entry.last_modified,
            })
            .collect();
        files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(files)
    }

    /// Read and split one file. Unreadable files are skipped unless the
    /// parse mode is fail-fast.
    async fn load(&self, file: &SourceFile) -> Result<Option<RawFile>, SourceError> {
        let result = async {
            let bytes = self
                .storage
                .get(&file.location()?)
                .await
                .context(ReadFileSnafu { path: &file.path })?;
            read_raw(&bytes, self.options.delimiter_byte(), self.options.header)
                .context(CsvSnafu { path: &file.path })
        }
        .await;

        match result {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if self.options.mode == ParseMode::FailFast => Err(e),
            Err(e) => {
                warn!(target = %self.name, path = %file.path, error = %e, "Skipping unreadable file");
                emit!(FileFailed {
                    target: self.name.clone(),
                });
                Ok(None)
            }
        }
    }

    fn with_rescue_column(&self, mut fields: Vec<Field>) -> Schema {
        let rescue = &self.options.rescued_data_column;
        fields.retain(|f| &f.name != rescue);
        fields.push(Field::new(rescue.clone(), DataType::String));
        Schema::new(fields)
    }

    /// Infer the initial schema from a sample of the batch's files.
    async fn infer_schema(&mut self, files: &[(SourceFile, RawFile)]) -> Result<(), SourceError> {
        let mut inferrer = SchemaInferrer::new(
            self.options.infer_column_types,
            self.options.schema_sample_rows,
        );
        for (_, raw) in files.iter().take(self.options.schema_sample_files.max(1)) {
            inferrer.observe(raw);
        }
        let schema = self.with_rescue_column(inferrer.finish());

        self.schema_log
            .write_schema(0, &schema)
            .await
            .context(SchemaLogSnafu)?;
        info!(
            target = %self.name,
            columns = ?schema.names().collect::<Vec<_>>(),
            "Inferred source schema"
        );
        self.schema = Some((0, schema));
        Ok(())
    }

    /// Handle columns of `raw` that are not in the schema.
    async fn reconcile(&mut self, file: &SourceFile, raw: &RawFile) -> Result<(), SourceError> {
        let Some((id, schema)) = &self.schema else {
            return Ok(());
        };
        let rescue = &self.options.rescued_data_column;
        let unknown: Vec<&String> = raw
            .header
            .iter()
            .filter(|name| *name != rescue && !schema.contains(name))
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }

        match self.options.schema_evolution {
            SchemaEvolutionMode::Rescue => Ok(()),
            SchemaEvolutionMode::FailOnNewColumns => UnexpectedColumnsSnafu {
                path: &file.path,
                columns: unknown
                    .iter()
                    .map(|name| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            }
            .fail(),
            SchemaEvolutionMode::AddNewColumns => {
                let mut inferrer = SchemaInferrer::new(
                    self.options.infer_column_types,
                    self.options.schema_sample_rows,
                );
                inferrer.observe(raw);
                let added: Vec<Field> = inferrer
                    .finish()
                    .into_iter()
                    .filter(|field| unknown.contains(&&field.name))
                    .collect();
                let added_count = added.len();

                let mut fields = schema.fields().to_vec();
                fields.extend(added);
                let evolved = self.with_rescue_column(fields);
                let next_id = id + 1;

                self.schema_log
                    .write_schema(next_id, &evolved)
                    .await
                    .context(SchemaLogSnafu)?;
                info!(
                    target = %self.name,
                    path = %file.path,
                    added = added_count,
                    schema_id = next_id,
                    "Source schema evolved"
                );
                emit!(SchemaEvolved {
                    added: added_count as u64,
                    target: self.name.clone(),
                });
                self.schema = Some((next_id, evolved));
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Source for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recover(&mut self, history: &[OffsetEntry]) -> Result<(), SourceError> {
        for entry in history {
            if let SourceOffset::Files { files } = &entry.offset {
                self.seen.extend(files.iter().map(|f| f.path.clone()));
            }
        }
        self.schema = self
            .schema_log
            .latest_schema()
            .await
            .context(SchemaLogSnafu)?;
        debug!(
            target = %self.name,
            seen = self.seen.len(),
            schema_id = ?self.schema.as_ref().map(|(id, _)| *id),
            "Recovered file source"
        );
        Ok(())
    }

    async fn plan(
        &mut self,
        _committed: Option<&SourceOffset>,
    ) -> Result<Option<SourceOffset>, SourceError> {
        let mut files = self.list_unseen().await?;
        if files.is_empty() {
            return Ok(None);
        }

        emit!(FilesDiscovered {
            count: files.len() as u64,
            target: self.name.clone(),
        });
        files.truncate(self.options.max_files_per_trigger.max(1));
        // Planned files are never offered again, even if the batch fails.
        self.seen.extend(files.iter().map(|f| f.path.clone()));
        Ok(Some(SourceOffset::Files { files }))
    }

    async fn read(
        &mut self,
        _start: Option<&SourceOffset>,
        end: &SourceOffset,
    ) -> Result<Batch, SourceError> {
        let SourceOffset::Files { files } = end else {
            return OffsetKindSnafu {
                source_name: &self.name,
                kind: end.kind(),
            }
            .fail();
        };

        let mut loaded = Vec::with_capacity(files.len());
        for file in files {
            if let Some(raw) = self.load(file).await? {
                loaded.push((file.clone(), raw));
            }
        }

        if self.schema.is_none() {
            if loaded.is_empty() {
                return Ok(Batch::default());
            }
            self.infer_schema(&loaded).await?;
        }

        let mut rows = Vec::new();
        let (mut dropped, mut rescued) = (0, 0);
        for (file, raw) in &loaded {
            self.reconcile(file, raw).await?;
            let Some((_, schema)) = &self.schema else {
                continue;
            };

            let url = self.storage.url_for(&file.location()?);
            let options = ParseOptions {
                mode: self.options.mode,
                rescued_data_column: &self.options.rescued_data_column,
            };
            let parsed = parse_records(raw, schema, options, &url)?;
            dropped += parsed.dropped;
            rescued += parsed.rescued;
            rows.extend(
                parsed
                    .records
                    .into_iter()
                    .map(|record| Row::new(record, Some(url.clone()))),
            );
        }

        emit!(RecordsRead {
            count: rows.len() as u64,
            target: self.name.clone(),
        });
        if dropped > 0 {
            emit!(RecordsDropped {
                count: dropped,
                reason: "malformed",
                target: self.name.clone(),
            });
        }
        if rescued > 0 {
            emit!(RecordsRescued {
                count: rescued,
                target: self.name.clone(),
            });
        }

        let schema = self.schema().cloned().unwrap_or_default();
        Ok(Batch::new(schema, rows))
    }

    async fn commit(&mut self, end: &SourceOffset) -> Result<(), SourceError> {
        if let SourceOffset::Files { files } = end {
            self.seen.extend(files.iter().map(|f| f.path.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use chrono::Utc;
    use medallion_core::StorageProvider;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        source_dir: TempDir,
        _checkpoint_dir: TempDir,
        source: FileSource,
        schema_log: CheckpointLog,
    }

    async fn fixture(options: IngestConfig) -> Fixture {
        let source_dir = TempDir::new().unwrap();
        let checkpoint_dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url(source_dir.path().to_str().unwrap())
            .await
            .unwrap();
        let checkpoints = StorageProvider::for_url(checkpoint_dir.path().to_str().unwrap())
            .await
            .unwrap();
        let schema_log = CheckpointLog::new(Arc::new(checkpoints), "customers");
        let source = FileSource::new(
            "ingest",
            Arc::new(storage),
            schema_log.clone(),
            options,
        );
        Fixture {
            source_dir,
            _checkpoint_dir: checkpoint_dir,
            source,
            schema_log,
        }
    }

    impl Fixture {
        fn write(&self, name: &str, content: &str) {
            let path = self.source_dir.path().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }

        async fn next_batch(&mut self) -> Option<(SourceOffset, Batch)> {
            let end = self.source.plan(None).await.unwrap()?;
            let batch = self.source.read(None, &end).await.unwrap();
            self.source.commit(&end).await.unwrap();
            Some((end, batch))
        }
    }

    fn planned_paths(offset: &SourceOffset) -> Vec<String> {
        match offset {
            SourceOffset::Files { files } => files.iter().map(|f| f.path.clone()).collect(),
            other => panic!("Expected files offset, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_directory_has_nothing_to_plan() {
        let mut fx = fixture(IngestConfig::default()).await;
        assert!(fx.source.plan(None).await.unwrap().is_none());
        assert!(fx.source.schema().is_none());
    }

    #[tokio::test]
    async fn test_discovery_filters_and_never_repeats() {
        let mut fx = fixture(IngestConfig::default()).await;
        fx.write("a.csv", "postcode,state\n0,CA\n");
        fx.write("region=west/b.CSV", "postcode,state\n1,CA\n");
        fx.write("notes.txt", "ignored");
        fx.write("_tmp.csv", "postcode,state\n2,CA\n");
        fx.write(".hidden/c.csv", "postcode,state\n3,CA\n");

        let (end, batch) = fx.next_batch().await.unwrap();
        let mut paths = planned_paths(&end);
        paths.sort();
        assert_eq!(paths, vec!["a.csv", "region=west/b.CSV"]);
        assert_eq!(batch.len(), 2);

        assert!(fx.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_max_files_per_trigger() {
        let options = IngestConfig {
            max_files_per_trigger: 2,
            ..IngestConfig::default()
        };
        let mut fx = fixture(options).await;
        for name in ["a.csv", "b.csv", "c.csv"] {
            fx.write(name, "postcode,state\n1,CA\n");
        }

        let (first, _) = fx.next_batch().await.unwrap();
        let (second, _) = fx.next_batch().await.unwrap();
        assert_eq!(planned_paths(&first).len(), 2);
        assert_eq!(planned_paths(&second).len(), 1);
        assert!(fx.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_schema_inferred_once_and_recorded() {
        let mut fx = fixture(IngestConfig::default()).await;
        fx.write("a.csv", "postcode,state\n0,CA\n12345,CA\n54321,NY\n");

        let (_, batch) = fx.next_batch().await.unwrap();
        let names: Vec<_> = batch.schema.names().collect();
        assert_eq!(names, vec!["postcode", "state", "_rescued_data"]);
        assert_eq!(batch.schema.fields()[0].data_type, DataType::Int64);
        assert_eq!(batch.rows[1].get("postcode"), &Value::Int64(12345));
        assert!(batch.rows[0].origin.as_deref().unwrap().ends_with("/a.csv"));

        let (id, recorded) = fx.schema_log.latest_schema().await.unwrap().unwrap();
        assert_eq!(id, 0);
        assert_eq!(recorded, batch.schema);
    }

    #[tokio::test]
    async fn test_new_columns_are_added() {
        let mut fx = fixture(IngestConfig::default()).await;
        fx.write("a.csv", "postcode,state\n1,CA\n");
        fx.next_batch().await.unwrap();

        fx.write("b.csv", "postcode,state,email\n2,NY,x@y.z\n");
        let (_, batch) = fx.next_batch().await.unwrap();

        let names: Vec<_> = batch.schema.names().collect();
        assert_eq!(names, vec!["postcode", "state", "email", "_rescued_data"]);
        assert_eq!(batch.rows[0].get("email"), &Value::String("x@y.z".into()));
        assert_eq!(fx.schema_log.latest_schema().await.unwrap().unwrap().0, 1);
    }

    #[tokio::test]
    async fn test_new_columns_rejected() {
        let options = IngestConfig {
            schema_evolution: SchemaEvolutionMode::FailOnNewColumns,
            ..IngestConfig::default()
        };
        let mut fx = fixture(options).await;
        fx.write("a.csv", "postcode,state\n1,CA\n");
        fx.next_batch().await.unwrap();

        fx.write("b.csv", "postcode,state,email\n2,NY,x@y.z\n");
        let end = fx.source.plan(None).await.unwrap().unwrap();
        let err = fx.source.read(None, &end).await.unwrap_err();
        assert!(matches!(err, SourceError::UnexpectedColumns { .. }));
    }

    #[tokio::test]
    async fn test_new_columns_rescued() {
        let options = IngestConfig {
            schema_evolution: SchemaEvolutionMode::Rescue,
            ..IngestConfig::default()
        };
        let mut fx = fixture(options).await;
        fx.write("a.csv", "postcode,state\n1,CA\n");
        fx.next_batch().await.unwrap();

        fx.write("b.csv", "postcode,state,email\n2,NY,x@y.z\n");
        let (_, batch) = fx.next_batch().await.unwrap();

        let names: Vec<_> = batch.schema.names().collect();
        assert_eq!(names, vec!["postcode", "state", "_rescued_data"]);
        assert_eq!(batch.rows[0].get("state"), &Value::String("NY".into()));

        let Value::String(rescued) = batch.rows[0].get("_rescued_data") else {
            panic!("Expected rescued data, got {:?}", batch.rows[0].get("_rescued_data"));
        };
        let rescued: serde_json::Value = serde_json::from_str(rescued).unwrap();
        assert_eq!(rescued["email"], "x@y.z");
        assert!(rescued["_file_path"].as_str().unwrap().ends_with("/b.csv"));
        assert_eq!(fx.schema_log.latest_schema().await.unwrap().unwrap().0, 0);
    }

    #[tokio::test]
    async fn test_file_names_with_reserved_characters() {
        let mut fx = fixture(IngestConfig::default()).await;
        fx.write("customers [2024] 100%.csv", "postcode,state\n12345,CA\n54321,NY\n");

        let (end, batch) = fx.next_batch().await.unwrap();
        assert_eq!(planned_paths(&end), vec!["customers [2024] 100%.csv"]);
        assert_eq!(batch.len(), 2);
        let origin = batch.rows[0].origin.as_deref().unwrap();
        assert!(origin.ends_with("/customers [2024] 100%.csv"), "{origin}");

        assert!(fx.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_recover_rebuilds_seen_files_and_schema() {
        let mut fx = fixture(IngestConfig::default()).await;
        fx.write("a.csv", "postcode,state\n1,CA\n");
        let (end, _) = fx.next_batch().await.unwrap();
        fx.write("b.csv", "postcode,state\n2,NY\n");

        let storage = StorageProvider::for_url(fx.source_dir.path().to_str().unwrap())
            .await
            .unwrap();
        let mut restarted = FileSource::new(
            "ingest",
            Arc::new(storage),
            fx.schema_log.clone(),
            IngestConfig::default(),
        );
        let history = vec![OffsetEntry {
            batch_id: 0,
            offset: end,
            planned_at: Utc::now(),
        }];
        restarted.recover(&history).await.unwrap();

        assert!(restarted.schema().is_some());
        let next = restarted.plan(None).await.unwrap().unwrap();
        assert_eq!(planned_paths(&next), vec!["b.csv"]);
    }

    #[tokio::test]
    async fn test_rejects_table_offsets() {
        let mut fx = fixture(IngestConfig::default()).await;
        let err = fx
            .source
            .read(None, &SourceOffset::Table { version: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::OffsetKind { kind: "table", .. }));
    }
}
