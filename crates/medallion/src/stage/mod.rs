//! Streaming queries.
//!
//! A stage reads new input from a [`Source`], runs it through a
//! [`Transform`] and commits the result through a [`TableSink`], one
//! micro-batch per trigger. Each stage runs as its own task driven by the
//! shared polling loop and reports its progress over a watch channel.
//!
//! A micro-batch goes through these steps, each durable before the next:
//!
//! 1. plan the end offset and write `offsets/N`
//! 2. read, transform and commit the output to the table (tagged with N)
//! 3. write the transform state as `state/N`
//! 4. write `commits/N`
//!
//! A crash anywhere leaves `offsets/N` without `commits/N`; the next start
//! replays batch N with the same offsets, and the sink skips the table
//! write if step 2 had already landed.

pub mod transform;

pub use transform::{Cleanse, CountBy, GroupCount, Passthrough, Transform};

use async_trait::async_trait;
use chrono::Utc;
use snafu::prelude::*;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use medallion_core::emit;
use medallion_core::metrics::events::BatchCommitted;
use medallion_core::{IterationResult, PollingProcessor, run_polling_loop};

use crate::checkpoint::{CheckpointLog, CommitEntry, OffsetEntry};
use crate::error::{PipelineError, QueryFailedSnafu, TaskJoinSnafu};
use crate::sink::{OutputMode, TableSink};
use crate::source::{Source, SourceOffset};
use crate::table::Table;

/// When a query looks for new input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Poll at a fixed interval until stopped.
    ProcessingTime(Duration),
    /// Process everything available, then stop.
    AvailableNow,
}

/// Lifecycle of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryState {
    Initializing,
    Active,
    Stopped,
    Failed(String),
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryState::Stopped | QueryState::Failed(_))
    }
}

/// Progress of a running query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryProgress {
    pub name: String,
    pub query_id: Option<Uuid>,
    pub state: QueryState,
    /// Triggers started since the query started.
    pub triggers: u64,
    /// Most recent trigger that found no new input.
    pub last_idle_trigger: Option<u64>,
    pub batches_completed: u64,
    pub last_batch_id: Option<u64>,
    pub num_input_rows: u64,
    pub num_output_rows: u64,
}

impl QueryProgress {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            query_id: None,
            state: QueryState::Initializing,
            triggers: 0,
            last_idle_trigger: None,
            batches_completed: 0,
            last_batch_id: None,
            num_input_rows: 0,
            num_output_rows: 0,
        }
    }

    /// Whether at least one trigger ran to completion.
    pub fn has_triggered(&self) -> bool {
        self.batches_completed > 0 || self.last_idle_trigger.is_some()
    }
}

/// Everything a stage reads from and writes to.
pub struct Stage {
    pub name: String,
    pub checkpoint: CheckpointLog,
    pub source: Box<dyn Source>,
    pub transform: Box<dyn Transform>,
    pub table: Table,
    pub mode: OutputMode,
}

/// The micro-batch a trigger works on.
#[derive(Debug, Clone)]
pub struct MicroBatch {
    pub batch_id: u64,
    /// End offset of the previous batch.
    pub start: Option<SourceOffset>,
    pub end: SourceOffset,
}

/// Drives one stage through the polling loop.
pub struct StageProcessor {
    stage: Stage,
    trigger: Trigger,
    sink: Option<TableSink>,
    pending: Option<OffsetEntry>,
    committed: Option<SourceOffset>,
    next_batch_id: u64,
    progress: watch::Sender<QueryProgress>,
}

impl StageProcessor {
    pub fn new(stage: Stage, trigger: Trigger, progress: watch::Sender<QueryProgress>) -> Self {
        Self {
            stage,
            trigger,
            sink: None,
            pending: None,
            committed: None,
            next_batch_id: 0,
            progress,
        }
    }

    /// Load the checkpoint and bring source, transform and sink up to the
    /// last committed batch.
    async fn recover(&mut self) -> Result<(), PipelineError> {
        let recovery = self.stage.checkpoint.recover().await?;
        let query_id = recovery.metadata.id;

        self.stage.source.recover(&recovery.offsets).await?;
        if let Some(last) = recovery.last_committed
            && let Some(state) = self.stage.checkpoint.read_state(last).await?
        {
            self.stage.transform.restore(state)?;
        }

        self.committed = recovery.committed_offset().cloned();
        self.pending = recovery.pending().cloned();
        self.next_batch_id = recovery.next_batch_id();
        self.sink = Some(TableSink::new(
            self.stage.table.clone(),
            self.stage.mode,
            query_id.to_string(),
            self.stage.name.clone(),
        ));

        info!(
            target = %self.stage.name,
            %query_id,
            last_committed = ?recovery.last_committed,
            next_batch_id = self.next_batch_id,
            "Query recovered from checkpoint"
        );
        self.progress.send_modify(|p| {
            p.query_id = Some(query_id);
            p.state = QueryState::Active;
        });
        Ok(())
    }
}

#[async_trait]
impl PollingProcessor for StageProcessor {
    type State = MicroBatch;
    type Error = PipelineError;

    async fn prepare(&mut self, cold_start: bool) -> Result<Option<MicroBatch>, PipelineError> {
        if cold_start {
            self.recover().await?;
        }
        self.progress.send_modify(|p| p.triggers += 1);

        if let Some(pending) = self.pending.take() {
            info!(
                target = %self.stage.name,
                batch_id = pending.batch_id,
                "Replaying uncommitted batch"
            );
            return Ok(Some(MicroBatch {
                batch_id: pending.batch_id,
                start: self.committed.clone(),
                end: pending.offset,
            }));
        }

        let Some(end) = self.stage.source.plan(self.committed.as_ref()).await? else {
            self.progress
                .send_modify(|p| p.last_idle_trigger = Some(p.triggers));
            return Ok(None);
        };

        let entry = OffsetEntry {
            batch_id: self.next_batch_id,
            offset: end,
            planned_at: Utc::now(),
        };
        self.stage.checkpoint.write_offset(&entry).await?;

        Ok(Some(MicroBatch {
            batch_id: entry.batch_id,
            start: self.committed.clone(),
            end: entry.offset,
        }))
    }

    async fn process(&mut self, batch: MicroBatch) -> Result<IterationResult, PipelineError> {
        let MicroBatch {
            batch_id,
            start,
            end,
        } = batch;

        let input = self.stage.source.read(start.as_ref(), &end).await?;
        let input_rows = input.len() as u64;
        let output = self.stage.transform.apply(input)?;
        let output_rows = output.len() as u64;

        let sink = self.sink.as_ref().context(QueryFailedSnafu {
            name: &self.stage.name,
            message: "sink used before recovery",
        })?;
        let written = sink.write(batch_id, &output).await?;

        if let Some(state) = self.stage.transform.state() {
            self.stage.checkpoint.write_state(batch_id, &state).await?;
        }
        self.stage
            .checkpoint
            .write_commit(&CommitEntry {
                batch_id,
                committed_at: Utc::now(),
                input_rows,
                output_rows,
                table_version: written.version,
            })
            .await?;
        self.stage.source.commit(&end).await?;

        self.committed = Some(end);
        self.next_batch_id = batch_id + 1;

        emit!(BatchCommitted {
            batch_id,
            target: self.stage.name.clone(),
        });
        debug!(
            target = %self.stage.name,
            batch_id,
            input_rows,
            output_rows,
            table_version = ?written.version,
            "Batch complete"
        );
        self.progress.send_modify(|p| {
            p.batches_completed += 1;
            p.last_batch_id = Some(batch_id);
            p.num_input_rows += input_rows;
            p.num_output_rows += output_rows;
        });
        Ok(IterationResult::ProcessedItems)
    }

    fn is_finished(&self) -> bool {
        self.trigger == Trigger::AvailableNow
    }
}

/// Handle to a stage running in the background.
pub struct StreamingQuery {
    name: String,
    progress: watch::Receiver<QueryProgress>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<(), PipelineError>>>,
}

impl StreamingQuery {
    /// Spawn a stage. `shutdown` stops the query when cancelled.
    pub fn start(
        stage: Stage,
        trigger: Trigger,
        poll_jitter_secs: u64,
        shutdown: &CancellationToken,
    ) -> Self {
        let name = stage.name.clone();
        let (tx, rx) = watch::channel(QueryProgress::new(&name));
        let cancel = shutdown.child_token();

        let poll_interval = match trigger {
            Trigger::ProcessingTime(interval) => interval,
            Trigger::AvailableNow => Duration::ZERO,
        };
        let token = cancel.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut processor = StageProcessor::new(stage, trigger, tx);
            let result =
                run_polling_loop(&mut processor, poll_interval, poll_jitter_secs, token, &task_name)
                    .await;
            let state = match &result {
                Ok(()) => {
                    info!(target = %task_name, "Query stopped");
                    QueryState::Stopped
                }
                Err(e) => {
                    error!(target = %task_name, error = %e, "Query failed");
                    QueryState::Failed(e.to_string())
                }
            };
            processor.progress.send_modify(|p| p.state = state);
            result
        });

        info!(target = %name, ?trigger, "Query started");
        Self {
            name,
            progress: rx,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> QueryProgress {
        self.progress.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        !self.progress.borrow().state.is_terminal()
    }

    /// Wait until `ready` holds or the query terminates. Returns the
    /// progress at that point.
    async fn wait_until(
        &self,
        ready: impl Fn(&QueryProgress) -> bool,
    ) -> Result<QueryProgress, PipelineError> {
        let mut rx = self.progress.clone();
        let outcome = rx
            .wait_for(|p| ready(p) || p.state.is_terminal())
            .await
            .map(|progress| progress.clone());
        // The task dropped its sender, so the last value is final.
        let progress = match outcome {
            Ok(progress) => progress,
            Err(_) => rx.borrow().clone(),
        };
        if let QueryState::Failed(message) = &progress.state {
            return QueryFailedSnafu {
                name: &self.name,
                message,
            }
            .fail();
        }
        Ok(progress)
    }

    /// Wait until the query has completed its first trigger.
    pub async fn block_until_ready(&self) -> Result<(), PipelineError> {
        self.wait_until(QueryProgress::has_triggered).await?;
        Ok(())
    }

    /// Wait until every input available now has been processed: a trigger
    /// that started after this call found nothing new, or the query ended.
    pub async fn process_all_available(&self) -> Result<(), PipelineError> {
        let started = self.progress.borrow().triggers;
        self.wait_until(|p| p.last_idle_trigger.is_some_and(|t| t > started))
            .await?;
        Ok(())
    }

    /// Wait until the query has stopped or failed, leaving its result to
    /// [`StreamingQuery::await_termination`].
    pub async fn terminated(&self) -> QueryState {
        let mut rx = self.progress.clone();
        let outcome = rx
            .wait_for(|p| p.state.is_terminal())
            .await
            .map(|progress| progress.state.clone());
        match outcome {
            Ok(state) => state,
            Err(_) => rx.borrow().state.clone(),
        }
    }

    /// Ask the query to stop after the batch in flight and wait for it.
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        self.cancel.cancel();
        self.await_termination().await
    }

    /// Wait for the query task to end, returning the error it failed with.
    pub async fn await_termination(&mut self) -> Result<(), PipelineError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.await.context(TaskJoinSnafu)?
    }
}

impl Drop for StreamingQuery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DataType, Field, Record, Row, Schema, Value};
    use crate::source::TableSource;
    use crate::table::Catalog;
    use medallion_core::StorageProvider;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        catalog: Catalog,
        checkpoints: Arc<StorageProvider>,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let warehouse = dir.path().join("warehouse");
            let checkpoints = dir.path().join("checkpoints");
            let catalog = Catalog::open(warehouse.to_str().unwrap()).await.unwrap();
            let checkpoints = StorageProvider::for_url(checkpoints.to_str().unwrap())
                .await
                .unwrap();
            Self {
                _dir: dir,
                catalog,
                checkpoints: Arc::new(checkpoints),
            }
        }

        fn stage(&self, transform: Box<dyn Transform>, mode: OutputMode) -> Stage {
            Stage {
                name: "test".to_string(),
                checkpoint: CheckpointLog::new(self.checkpoints.clone(), "test"),
                source: Box::new(TableSource::new("test", self.catalog.table("upstream"))),
                transform,
                table: self.catalog.table("downstream"),
                mode,
            }
        }

        async fn append_upstream(&self, batch_id: u64, states: &[&str]) {
            let schema = Schema::new(vec![
                Field::new("postcode", DataType::Int64),
                Field::new("state", DataType::String),
            ]);
            let rows = states
                .iter()
                .map(|state| {
                    let mut record = Record::new();
                    record.insert("postcode".to_string(), Value::Int64(1));
                    record.insert("state".to_string(), Value::String(state.to_string()));
                    Row::new(record, Some("file:///in/a.csv".to_string()))
                })
                .collect();
            TableSink::new(
                self.catalog.table("upstream"),
                OutputMode::Append,
                "writer",
                "upstream",
            )
            .write(batch_id, &crate::source::Batch::new(schema, rows))
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_available_now_processes_backlog_and_stops() {
        let fixture = Fixture::new().await;
        fixture.append_upstream(0, &["CA", "NY"]).await;
        fixture.append_upstream(1, &["CA"]).await;

        let shutdown = CancellationToken::new();
        let mut query = StreamingQuery::start(
            fixture.stage(Box::new(Passthrough), OutputMode::Append),
            Trigger::AvailableNow,
            0,
            &shutdown,
        );
        query.await_termination().await.unwrap();

        let progress = query.progress();
        assert_eq!(progress.state, QueryState::Stopped);
        assert_eq!(progress.batches_completed, 1);
        assert_eq!(progress.num_output_rows, 3);

        let snapshot = fixture.catalog.table("downstream").snapshot().await.unwrap();
        assert_eq!(snapshot.num_records(), 3);
    }

    #[tokio::test]
    async fn test_restart_continues_from_checkpoint() {
        let fixture = Fixture::new().await;
        fixture.append_upstream(0, &["CA"]).await;

        let shutdown = CancellationToken::new();
        let mut query = StreamingQuery::start(
            fixture.stage(Box::new(CountBy::new("state", "n")), OutputMode::Complete),
            Trigger::AvailableNow,
            0,
            &shutdown,
        );
        query.await_termination().await.unwrap();

        fixture.append_upstream(1, &["CA", "NY"]).await;
        let mut query = StreamingQuery::start(
            fixture.stage(Box::new(CountBy::new("state", "n")), OutputMode::Complete),
            Trigger::AvailableNow,
            0,
            &shutdown,
        );
        query.await_termination().await.unwrap();
        assert_eq!(query.progress().last_batch_id, Some(1));

        let table = fixture.catalog.table("downstream");
        let rows = table.read_rows(&table.snapshot().await.unwrap()).await.unwrap();
        let counts: Vec<_> = rows
            .iter()
            .map(|row| (row.get("state").to_string(), row.get("n").clone()))
            .collect();
        assert_eq!(
            counts,
            vec![
                ("CA".to_string(), Value::Int64(2)),
                ("NY".to_string(), Value::Int64(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_ready_after_idle_trigger() {
        let fixture = Fixture::new().await;
        let shutdown = CancellationToken::new();
        let mut query = StreamingQuery::start(
            fixture.stage(Box::new(Passthrough), OutputMode::Append),
            Trigger::ProcessingTime(Duration::from_millis(20)),
            0,
            &shutdown,
        );

        tokio::time::timeout(Duration::from_secs(10), query.block_until_ready())
            .await
            .expect("query should become ready")
            .unwrap();
        assert!(query.is_active());

        fixture.append_upstream(0, &["CA"]).await;
        tokio::time::timeout(Duration::from_secs(10), query.process_all_available())
            .await
            .expect("query should catch up")
            .unwrap();
        assert_eq!(query.progress().num_output_rows, 1);

        query.stop().await.unwrap();
        assert_eq!(query.progress().state, QueryState::Stopped);
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let fixture = Fixture::new().await;
        fixture.append_upstream(0, &["CA"]).await;

        let shutdown = CancellationToken::new();
        let mut query = StreamingQuery::start(
            fixture.stage(Box::new(CountBy::new("missing", "n")), OutputMode::Complete),
            Trigger::ProcessingTime(Duration::from_millis(20)),
            0,
            &shutdown,
        );

        let err = query.block_until_ready().await.unwrap_err();
        assert!(matches!(err, PipelineError::QueryFailed { .. }));
        assert!(query.await_termination().await.is_err());
        assert!(matches!(query.progress().state, QueryState::Failed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_token_stops_query() {
        let fixture = Fixture::new().await;
        let shutdown = CancellationToken::new();
        let mut query = StreamingQuery::start(
            fixture.stage(Box::new(Passthrough), OutputMode::Append),
            Trigger::ProcessingTime(Duration::from_secs(3600)),
            0,
            &shutdown,
        );
        query.block_until_ready().await.unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), query.await_termination())
            .await
            .expect("query should stop")
            .unwrap();
    }
}
