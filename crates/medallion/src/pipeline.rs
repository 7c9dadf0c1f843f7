//! The pipeline orchestrator.
//!
//! [`Medallion`] resolves storage locations once, starts the three stages
//! as independent streaming queries and owns their shutdown. Stages only
//! talk to each other through committed tables: ingest writes bronze,
//! cleanse reads bronze and writes silver, aggregate reads silver and
//! rewrites gold.

use futures::future::select_all;
use indexmap::IndexMap;
use snafu::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use medallion_core::{StorageProvider, StorageProviderRef};

use crate::checkpoint::CheckpointLog;
use crate::config::{
    AGGREGATE_CHECKPOINT, CLEANSE_CHECKPOINT, INGEST_CHECKPOINT, PipelineConfig,
};
use crate::error::{AlreadyRunningSnafu, PipelineError};
use crate::record::Value;
use crate::sink::OutputMode;
use crate::source::{FileSource, Source, TableSource};
use crate::stage::{
    Cleanse, CountBy, GroupCount, Passthrough, Stage, StreamingQuery, Transform, Trigger,
};
use crate::table::{Catalog, Table};

/// Query name of the ingest stage.
pub const INGEST: &str = "ingest";
/// Query name of the cleanse stage.
pub const CLEANSE: &str = "cleanse";
/// Query name of the aggregate stage.
pub const AGGREGATE: &str = "aggregate";

/// What teardown removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownSummary {
    pub tables_dropped: usize,
    pub checkpoint_files_removed: usize,
}

/// A running bronze/silver/gold pipeline.
pub struct Medallion {
    config: PipelineConfig,
    source: StorageProviderRef,
    checkpoints: StorageProviderRef,
    catalog: Catalog,
    shutdown: CancellationToken,
    queries: IndexMap<&'static str, StreamingQuery>,
}

impl Medallion {
    /// Validate the configuration and resolve every storage location.
    pub async fn open(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let source = StorageProvider::for_url(&config.paths.source).await?;
        let checkpoints = StorageProvider::for_url(&config.paths.checkpoints).await?;
        let catalog = Catalog::open(&config.paths.warehouse).await?;

        info!(
            source = source.canonical_url(),
            warehouse = catalog.url(),
            checkpoints = checkpoints.canonical_url(),
            "Opened pipeline"
        );
        Ok(Self {
            config,
            source: Arc::new(source),
            checkpoints: Arc::new(checkpoints),
            catalog,
            shutdown: CancellationToken::new(),
            queries: IndexMap::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Token that stops every query when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Trigger described by the configuration.
    pub fn default_trigger(&self) -> Trigger {
        if self.config.trigger.available_now {
            Trigger::AvailableNow
        } else {
            Trigger::ProcessingTime(self.config.trigger.poll_interval())
        }
    }

    pub fn bronze(&self) -> Table {
        self.catalog.table(&self.config.tables.bronze)
    }

    pub fn silver(&self) -> Table {
        self.catalog.table(&self.config.tables.silver)
    }

    pub fn gold(&self) -> Table {
        self.catalog.table(&self.config.tables.gold)
    }

    pub fn checkpoint(&self, dir: &str) -> CheckpointLog {
        CheckpointLog::new(self.checkpoints.clone(), dir)
    }

    /// Running (or finished but not yet stopped) queries in start order.
    pub fn queries(&self) -> impl Iterator<Item = &StreamingQuery> {
        self.queries.values()
    }

    pub fn query(&self, name: &str) -> Option<&StreamingQuery> {
        self.queries.get(name)
    }

    fn start(
        &mut self,
        name: &'static str,
        stage: Stage,
        trigger: Trigger,
    ) -> Result<&StreamingQuery, PipelineError> {
        if let Some(existing) = self.queries.get(name) {
            ensure!(!existing.is_active(), AlreadyRunningSnafu { name });
        }
        let query = StreamingQuery::start(
            stage,
            trigger,
            self.config.global.poll_jitter_secs,
            &self.shutdown,
        );
        self.queries.insert(name, query);
        Ok(&self.queries[name])
    }

    fn stage(
        &self,
        name: &'static str,
        checkpoint: &str,
        source: Box<dyn Source>,
        transform: Box<dyn Transform>,
        table: Table,
        mode: OutputMode,
    ) -> Stage {
        Stage {
            name: name.to_string(),
            checkpoint: self.checkpoint(checkpoint),
            source,
            transform,
            table,
            mode,
        }
    }

    /// Start loading new source files into bronze.
    pub fn start_ingest(&mut self, trigger: Trigger) -> Result<&StreamingQuery, PipelineError> {
        let source = FileSource::new(
            INGEST,
            self.source.clone(),
            self.checkpoint(INGEST_CHECKPOINT),
            self.config.ingest.clone(),
        );
        let stage = self.stage(
            INGEST,
            INGEST_CHECKPOINT,
            Box::new(source),
            Box::new(Passthrough),
            self.bronze(),
            OutputMode::Append,
        );
        self.start(INGEST, stage, trigger)
    }

    /// Start cleansing new bronze rows into silver.
    pub fn start_cleanse(&mut self, trigger: Trigger) -> Result<&StreamingQuery, PipelineError> {
        let stage = self.stage(
            CLEANSE,
            CLEANSE_CHECKPOINT,
            Box::new(TableSource::new(CLEANSE, self.bronze())),
            Box::new(Cleanse::new(&self.config.cleanse.key_column, CLEANSE)),
            self.silver(),
            OutputMode::Append,
        );
        self.start(CLEANSE, stage, trigger)
    }

    /// Start maintaining the gold counts from new silver rows.
    pub fn start_aggregate(&mut self, trigger: Trigger) -> Result<&StreamingQuery, PipelineError> {
        let aggregate = &self.config.aggregate;
        let stage = self.stage(
            AGGREGATE,
            AGGREGATE_CHECKPOINT,
            Box::new(TableSource::new(AGGREGATE, self.silver())),
            Box::new(CountBy::new(&aggregate.group_by, &aggregate.count_column)),
            self.gold(),
            OutputMode::Complete,
        );
        self.start(AGGREGATE, stage, trigger)
    }

    /// Start every stage in order, upstream first.
    ///
    /// With a processing-time trigger each stage is started once the
    /// previous one is ready. With `AvailableNow` each stage runs to
    /// completion before the next starts, so downstream stages see all of
    /// their input.
    pub async fn start_all(&mut self, trigger: Trigger) -> Result<(), PipelineError> {
        self.start_ingest(trigger)?;
        self.settle(INGEST, trigger).await?;
        self.start_cleanse(trigger)?;
        self.settle(CLEANSE, trigger).await?;
        self.start_aggregate(trigger)?;
        self.settle(AGGREGATE, trigger).await
    }

    async fn settle(&mut self, name: &str, trigger: Trigger) -> Result<(), PipelineError> {
        let Some(query) = self.queries.get_mut(name) else {
            return Ok(());
        };
        match trigger {
            Trigger::AvailableNow => query.await_termination().await,
            Trigger::ProcessingTime(_) => query.block_until_ready().await,
        }
    }

    /// Wait until every query has processed everything available, upstream
    /// stages first.
    pub async fn process_all_available(&self) -> Result<(), PipelineError> {
        for query in self.queries.values() {
            query.process_all_available().await?;
        }
        Ok(())
    }

    /// Current gold counts, read once from the latest snapshot.
    pub async fn report(&self) -> Result<Vec<GroupCount>, PipelineError> {
        let gold = self.gold();
        let snapshot = gold.snapshot().await?;
        let rows = gold.read_rows(&snapshot).await?;

        let aggregate = &self.config.aggregate;
        let mut counts: Vec<GroupCount> = rows
            .iter()
            .map(|row| GroupCount {
                key: row.get(&aggregate.group_by).group_key(),
                count: match row.get(&aggregate.count_column) {
                    Value::Int64(count) => *count,
                    other => other.as_f64().map_or(0, |count| count as i64),
                },
            })
            .collect();
        counts.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(counts)
    }

    /// Stop every query, downstream first. Returns the first failure.
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        self.shutdown.cancel();
        let mut first_error = None;
        for (name, mut query) in self.queries.drain(..).rev() {
            if let Err(e) = query.stop().await {
                warn!(target = name, error = %e, "Query ended with an error");
                first_error.get_or_insert(e);
            }
        }
        self.shutdown = CancellationToken::new();
        first_error.map_or(Ok(()), Err)
    }

    /// Wait for every query to end on its own, as `AvailableNow` queries do.
    pub async fn await_termination(&mut self) -> Result<(), PipelineError> {
        for query in self.queries.values_mut() {
            query.await_termination().await?;
        }
        Ok(())
    }

    /// Wait until any query ends, returning the error it failed with.
    ///
    /// Returns at once when no query was started.
    pub async fn await_any_termination(&mut self) -> Result<(), PipelineError> {
        if self.queries.is_empty() {
            return Ok(());
        }
        let (_, index, _) =
            select_all(self.queries.values().map(|query| Box::pin(query.terminated()))).await;

        let Some((name, query)) = self.queries.get_index_mut(index) else {
            return Ok(());
        };
        info!(target = *name, state = ?query.progress().state, "Query terminated");
        query.await_termination().await
    }

    /// Stop every query, then delete all tables and checkpoints the pipeline
    /// created. Missing tables and checkpoints are skipped.
    pub async fn teardown(&mut self) -> Result<TeardownSummary, PipelineError> {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "Tearing down after a failed query");
        }

        let mut summary = TeardownSummary::default();
        for table in self.config.table_names() {
            if self.catalog.drop_table(table).await? {
                summary.tables_dropped += 1;
            }
        }
        for dir in PipelineConfig::checkpoint_dirs() {
            summary.checkpoint_files_removed += self.checkpoint(dir).delete().await?;
        }

        info!(
            tables_dropped = summary.tables_dropped,
            checkpoint_files_removed = summary.checkpoint_files_removed,
            "Teardown complete"
        );
        Ok(summary)
    }
}
