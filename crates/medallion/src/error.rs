//! Error types for the medallion pipeline.

use snafu::prelude::*;

// Re-export common errors
pub use medallion_core::error::{ConfigError, MetricsError, StorageError};

/// Errors raised by the transactional table log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TableError {
    /// Storage operation on the table failed.
    #[snafu(display("Storage error on table '{table}': {source}"))]
    TableStorage { table: String, source: StorageError },

    /// Storage operation on the warehouse root failed.
    #[snafu(display("Storage error in warehouse {url}: {source}"))]
    Catalog { url: String, source: StorageError },

    /// Another writer committed the same version first.
    #[snafu(display("Commit conflict on table '{table}': version {version} already exists"))]
    CommitConflict { table: String, version: u64 },

    /// A log entry could not be parsed.
    #[snafu(display("Failed to parse log entry {version} of table '{table}': {source}"))]
    ParseLog {
        table: String,
        version: u64,
        source: serde_json::Error,
    },

    /// A log checkpoint could not be parsed.
    #[snafu(display("Failed to parse checkpoint {version} of table '{table}': {source}"))]
    ParseCheckpoint {
        table: String,
        version: u64,
        source: serde_json::Error,
    },

    /// A data file could not be decoded.
    #[snafu(display("Failed to decode data file {path}: {source}"))]
    DecodeData {
        path: String,
        source: serde_json::Error,
    },

    /// Failed to serialize actions or rows.
    #[snafu(display("Failed to serialize table content: {source}"))]
    Serialize { source: serde_json::Error },

    /// Incoming schema cannot be merged into the table schema.
    #[snafu(display("Schema mismatch on table '{table}': {message}"))]
    SchemaMismatch { table: String, message: String },

    /// The table has no commits.
    #[snafu(display("Table '{table}' does not exist"))]
    TableNotFound { table: String },
}

/// Errors raised while reading or writing a stage checkpoint.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Storage operation on the checkpoint failed.
    #[snafu(display("Checkpoint storage error: {source}"))]
    CheckpointStorage { source: StorageError },

    /// A checkpoint file is not valid JSON.
    #[snafu(display("Corrupt checkpoint file {path}: {source}"))]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },

    /// Failed to serialize checkpoint content.
    #[snafu(display("Failed to serialize checkpoint content: {source}"))]
    SerializeCheckpoint { source: serde_json::Error },

    /// Another query already wrote this log entry.
    #[snafu(display("Checkpoint entry {path} was written by another query"))]
    ConcurrentQuery { path: String },
}

/// Errors raised by stage sources.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// Listing the source directory failed.
    #[snafu(display("Failed to list source files: {source}"))]
    List { source: StorageError },

    /// A recorded source path is not a valid object path.
    #[snafu(display("Invalid source path {path}: {source}"))]
    InvalidPath {
        path: String,
        source: object_store::path::Error,
    },

    /// A source file could not be read.
    #[snafu(display("Failed to read source file {path}: {source}"))]
    ReadFile { path: String, source: StorageError },

    /// The CSV reader failed on a file.
    #[snafu(display("Failed to parse CSV file {path}: {source}"))]
    Csv { path: String, source: csv::Error },

    /// A record did not match the schema in fail-fast mode.
    #[snafu(display("Malformed record in {path} at line {line}: {message}"))]
    MalformedRecord {
        path: String,
        line: u64,
        message: String,
    },

    /// A file introduced columns while new columns are rejected.
    #[snafu(display("File {path} has columns not in the schema: {columns}"))]
    UnexpectedColumns { path: String, columns: String },

    /// Persisting the inferred schema failed.
    #[snafu(display("Failed to persist schema: {source}"))]
    SchemaLog { source: CheckpointError },

    /// Reading the upstream table failed.
    #[snafu(display("Failed to read upstream table: {source}"))]
    Upstream { source: TableError },

    /// The upstream table removed data, which a streaming read cannot follow.
    #[snafu(display(
        "Table '{table}' version {version} removes data; only appends can be streamed"
    ))]
    NonAppendChange { table: String, version: u64 },

    /// An offset of the wrong kind was handed to a source.
    #[snafu(display("Source '{source_name}' cannot use a {kind} offset"))]
    OffsetKind {
        source_name: String,
        kind: &'static str,
    },
}

/// Errors raised by transforms.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    /// A required column is missing from the input schema.
    #[snafu(display("Transform '{transform}' requires column '{column}'"))]
    MissingColumn {
        transform: &'static str,
        column: String,
    },

    /// Saved transform state could not be decoded.
    #[snafu(display("Failed to decode state for transform '{transform}': {source}"))]
    DecodeState {
        transform: &'static str,
        source: serde_json::Error,
    },
}

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Storage error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Table error.
    #[snafu(display("Table error: {source}"))]
    Table { source: TableError },

    /// Checkpoint error.
    #[snafu(display("Checkpoint error: {source}"))]
    Checkpoint { source: CheckpointError },

    /// Source error.
    #[snafu(display("Source error: {source}"))]
    Source { source: SourceError },

    /// Transform error.
    #[snafu(display("Transform error: {source}"))]
    Transform { source: TransformError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// Task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// A stage query terminated with an error.
    #[snafu(display("Query '{name}' failed: {message}"))]
    QueryFailed { name: String, message: String },

    /// A stage query is already running.
    #[snafu(display("Query '{name}' is already running"))]
    AlreadyRunning { name: String },
}

impl PipelineError {
    /// Check if this error represents a "not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            PipelineError::Storage { source } => source.is_not_found(),
            PipelineError::Table {
                source: TableError::TableNotFound { .. },
            } => true,
            _ => false,
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<TableError> for PipelineError {
    fn from(source: TableError) -> Self {
        PipelineError::Table { source }
    }
}

impl From<CheckpointError> for PipelineError {
    fn from(source: CheckpointError) -> Self {
        PipelineError::Checkpoint { source }
    }
}

impl From<SourceError> for PipelineError {
    fn from(source: SourceError) -> Self {
        PipelineError::Source { source }
    }
}

impl From<TransformError> for PipelineError {
    fn from(source: TransformError) -> Self {
        PipelineError::Transform { source }
    }
}

impl From<MetricsError> for PipelineError {
    fn from(source: MetricsError) -> Self {
        PipelineError::Metrics { source }
    }
}
