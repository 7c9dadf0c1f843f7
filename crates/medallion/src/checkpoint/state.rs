//! Entries of a stage checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::source::SourceOffset;

/// Identity of a streaming query, stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl QueryMetadata {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }
}

impl Default for QueryMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// The planned input of one micro-batch, written before it is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetEntry {
    pub batch_id: u64,
    pub offset: SourceOffset,
    pub planned_at: DateTime<Utc>,
}

/// Marker that a micro-batch finished, written after its output committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub batch_id: u64,
    pub committed_at: DateTime<Utc>,
    pub input_rows: u64,
    pub output_rows: u64,
    /// Table version the batch produced, `None` if the write was skipped.
    #[serde(default)]
    pub table_version: Option<u64>,
}

/// What a restarting query needs to know.
#[derive(Debug, Clone)]
pub struct Recovery {
    pub metadata: QueryMetadata,
    /// Every planned batch, ascending.
    pub offsets: Vec<OffsetEntry>,
    /// Highest batch with a commit marker.
    pub last_committed: Option<u64>,
}

impl Recovery {
    /// Offset of the last committed batch.
    pub fn committed_offset(&self) -> Option<&SourceOffset> {
        let last = self.last_committed?;
        self.offsets
            .iter()
            .find(|entry| entry.batch_id == last)
            .map(|entry| &entry.offset)
    }

    /// A batch that was planned but never committed, which must be replayed.
    pub fn pending(&self) -> Option<&OffsetEntry> {
        let latest = self.offsets.last()?;
        match self.last_committed {
            Some(committed) if latest.batch_id <= committed => None,
            _ => Some(latest),
        }
    }

    /// Id of the next batch to plan after any pending batch.
    pub fn next_batch_id(&self) -> u64 {
        let planned = self.offsets.last().map(|entry| entry.batch_id);
        planned
            .max(self.last_committed)
            .map_or(0, |batch_id| batch_id + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(batch_id: u64) -> OffsetEntry {
        OffsetEntry {
            batch_id,
            offset: SourceOffset::Table { version: batch_id },
            planned_at: Utc::now(),
        }
    }

    fn recovery(offsets: Vec<OffsetEntry>, last_committed: Option<u64>) -> Recovery {
        Recovery {
            metadata: QueryMetadata::new(),
            offsets,
            last_committed,
        }
    }

    #[test]
    fn test_fresh_checkpoint() {
        let recovery = recovery(vec![], None);
        assert!(recovery.pending().is_none());
        assert!(recovery.committed_offset().is_none());
        assert_eq!(recovery.next_batch_id(), 0);
    }

    #[test]
    fn test_all_batches_committed() {
        let recovery = recovery(vec![offset(0), offset(1)], Some(1));
        assert!(recovery.pending().is_none());
        assert_eq!(
            recovery.committed_offset(),
            Some(&SourceOffset::Table { version: 1 })
        );
        assert_eq!(recovery.next_batch_id(), 2);
    }

    #[test]
    fn test_uncommitted_batch_is_pending() {
        let recovery = recovery(vec![offset(0), offset(1), offset(2)], Some(1));
        assert_eq!(recovery.pending().map(|e| e.batch_id), Some(2));
        assert_eq!(
            recovery.committed_offset(),
            Some(&SourceOffset::Table { version: 1 })
        );
        assert_eq!(recovery.next_batch_id(), 3);
    }

    #[test]
    fn test_first_batch_never_committed() {
        let recovery = recovery(vec![offset(0)], None);
        assert_eq!(recovery.pending().map(|e| e.batch_id), Some(0));
        assert!(recovery.committed_offset().is_none());
    }

    #[test]
    fn test_metadata_ids_are_unique() {
        assert_ne!(QueryMetadata::new().id, QueryMetadata::new().id);
    }
}
