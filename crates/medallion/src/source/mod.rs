//! Stage inputs.
//!
//! A [`Source`] turns "what is new since the last committed offset" into a
//! [`SourceOffset`] and then reads exactly the rows that offset describes.
//! Offsets are logged before a batch is processed, so `read` must return
//! the same rows when handed the same offsets again.
//!
//! - [`FileSource`]: new CSV files in a directory (ingest)
//! - [`TableSource`]: new commits of an append-only table (cleanse, aggregate)

mod delimited;
mod files;
mod inference;
mod table;

pub use files::FileSource;
pub use table::TableSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::checkpoint::OffsetEntry;
use crate::error::{InvalidPathSnafu, SourceError};
use crate::record::{Row, Schema};

/// A discovered source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path relative to the source directory.
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl SourceFile {
    /// The file's location in the source store.
    ///
    /// `path` is kept in its listed, already encoded form and must be
    /// parsed back verbatim; `Path::from` would encode it a second time.
    pub fn location(&self) -> Result<Path, SourceError> {
        Path::parse(&self.path).context(InvalidPathSnafu { path: &self.path })
    }
}

/// Position of a source, as recorded in the checkpoint offset log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceOffset {
    /// The files that make up one batch.
    Files { files: Vec<SourceFile> },
    /// Every table version up to and including `version`.
    Table { version: u64 },
}

impl SourceOffset {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceOffset::Files { .. } => "files",
            SourceOffset::Table { .. } => "table",
        }
    }
}

/// Rows of one micro-batch and the schema they follow.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub schema: Schema,
    pub rows: Vec<Row>,
}

impl Batch {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Incremental input of a stage.
#[async_trait]
pub trait Source: Send {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Rebuild in-memory state from the offset log, including any batch
    /// that is about to be replayed.
    async fn recover(&mut self, history: &[OffsetEntry]) -> Result<(), SourceError>;

    /// End offset of the next batch, or `None` if nothing is new.
    async fn plan(
        &mut self,
        committed: Option<&SourceOffset>,
    ) -> Result<Option<SourceOffset>, SourceError>;

    /// Read the rows between `start` (exclusive) and `end` (inclusive).
    async fn read(
        &mut self,
        start: Option<&SourceOffset>,
        end: &SourceOffset,
    ) -> Result<Batch, SourceError>;

    /// Called once the batch ending at `end` has committed.
    async fn commit(&mut self, end: &SourceOffset) -> Result<(), SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_tagged_by_kind() {
        let offset = SourceOffset::Table { version: 7 };
        let json = serde_json::to_value(&offset).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "table", "version": 7}));

        let files = SourceOffset::Files {
            files: vec![SourceFile {
                path: "a.csv".to_string(),
                size: 12,
                modified: DateTime::from_timestamp(0, 0).unwrap(),
            }],
        };
        let json = serde_json::to_string(&files).unwrap();
        assert_eq!(serde_json::from_str::<SourceOffset>(&json).unwrap(), files);
        assert_eq!(files.kind(), "files");
    }
}
