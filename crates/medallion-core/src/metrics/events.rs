//! Internal events for medallion metrics emission.
//!
//! Each event struct represents a measurable occurrence in a pipeline stage.
//! Events implement the `InternalEvent` trait which records the corresponding
//! metric through the `metrics` facade.
//!
//! ## Target Labels
//!
//! Stage-level metrics carry a `target` label naming the stage
//! (e.g., `"ingest"`, `"cleanse"`, `"aggregate"`).

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============ Storage ============

/// Storage operation type.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    List,
    Delete,
    Rename,
}

impl StorageOperation {
    fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::List => "list",
            StorageOperation::Delete => "delete",
            StorageOperation::Rename => "rename",
        }
    }
}

/// Outcome of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    /// Status from an operation result.
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted for every storage request.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        counter!(
            "medallion_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted with the latency of a storage request.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        histogram!(
            "medallion_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

// ============ Sources ============

/// Event emitted when new source files are discovered.
pub struct FilesDiscovered {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for FilesDiscovered {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Files discovered");
        counter!("medallion_files_discovered_total", "target" => self.target).increment(self.count);
    }
}

/// Event emitted when a source file could not be read.
pub struct FileFailed {
    pub target: String,
}

impl InternalEvent for FileFailed {
    fn emit(self) {
        trace!(target = %self.target, "File failed");
        counter!("medallion_files_failed_total", "target" => self.target).increment(1);
    }
}

/// Event emitted when records are read into a micro-batch.
pub struct RecordsRead {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RecordsRead {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Records read");
        counter!("medallion_records_read_total", "target" => self.target).increment(self.count);
    }
}

/// Event emitted when records are dropped by a filter or a parse mode.
pub struct RecordsDropped {
    pub count: u64,
    pub reason: &'static str,
    pub target: String,
}

impl InternalEvent for RecordsDropped {
    fn emit(self) {
        trace!(count = self.count, reason = self.reason, target = %self.target, "Records dropped");
        counter!(
            "medallion_records_dropped_total",
            "reason" => self.reason,
            "target" => self.target
        )
        .increment(self.count);
    }
}

/// Event emitted when values are moved into the rescued data column.
pub struct RecordsRescued {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RecordsRescued {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Records rescued");
        counter!("medallion_records_rescued_total", "target" => self.target).increment(self.count);
    }
}

/// Event emitted when the ingest schema gains columns.
pub struct SchemaEvolved {
    pub added: u64,
    pub target: String,
}

impl InternalEvent for SchemaEvolved {
    fn emit(self) {
        trace!(added = self.added, target = %self.target, "Schema evolved");
        counter!("medallion_schema_evolutions_total", "target" => self.target).increment(1);
    }
}

// ============ Sinks ============

/// Event emitted when records are committed to a table.
pub struct RecordsWritten {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RecordsWritten {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Records written");
        counter!("medallion_records_written_total", "target" => self.target).increment(self.count);
    }
}

/// Event emitted when a micro-batch is committed.
pub struct BatchCommitted {
    pub batch_id: u64,
    pub target: String,
}

impl InternalEvent for BatchCommitted {
    fn emit(self) {
        trace!(batch_id = self.batch_id, target = %self.target, "Batch committed");
        counter!("medallion_batches_committed_total", "target" => self.target.clone()).increment(1);
        gauge!("medallion_last_batch_id", "target" => self.target).set(self.batch_id as f64);
    }
}

/// Event emitted when a replayed batch was already in the table.
pub struct BatchSkipped {
    pub batch_id: u64,
    pub target: String,
}

impl InternalEvent for BatchSkipped {
    fn emit(self) {
        trace!(batch_id = self.batch_id, target = %self.target, "Batch already committed");
        counter!("medallion_batches_skipped_total", "target" => self.target).increment(1);
    }
}

/// Event emitted with the duration of a table commit.
pub struct CommitDuration {
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for CommitDuration {
    fn emit(self) {
        histogram!("medallion_commit_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted with the version of a table after a commit.
pub struct TableVersion {
    pub version: i64,
    pub target: String,
}

impl InternalEvent for TableVersion {
    fn emit(self) {
        gauge!("medallion_table_version", "target" => self.target).set(self.version as f64);
    }
}

// ============ Polling ============

/// Result type for an iteration.
#[derive(Debug, Clone, Copy)]
pub enum IterationResultType {
    Processed,
    NoItems,
}

impl IterationResultType {
    fn as_str(&self) -> &'static str {
        match self {
            IterationResultType::Processed => "processed",
            IterationResultType::NoItems => "no_items",
        }
    }
}

/// Event emitted when a polling iteration completes.
pub struct IterationCompleted {
    pub result: IterationResultType,
    pub target: String,
}

impl InternalEvent for IterationCompleted {
    fn emit(self) {
        counter!(
            "medallion_iterations_total",
            "result" => self.result.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

/// Event emitted with the duration of a polling iteration.
pub struct IterationDuration {
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for IterationDuration {
    fn emit(self) {
        histogram!("medallion_iteration_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}
