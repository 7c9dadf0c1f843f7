//! Per-stage transformations.
//!
//! A transform maps the rows of one micro-batch to the rows its stage
//! writes. Stateful transforms expose their state so it can be saved in
//! the checkpoint after every batch and restored on restart.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::BTreeMap;

use medallion_core::emit;
use medallion_core::metrics::events::RecordsDropped;

use crate::error::{DecodeStateSnafu, MissingColumnSnafu, TransformError};
use crate::record::{DataType, Field, Record, Row, Schema, Value};
use crate::source::Batch;

/// Column holding the processing time of the batch.
pub const RECEIPT_TIME_COLUMN: &str = "receipt_time";
/// Column holding the file a row was originally read from.
pub const SOURCE_FILE_COLUMN: &str = "source_file";

/// A batch-to-batch transformation.
pub trait Transform: Send {
    fn name(&self) -> &'static str;

    fn apply(&mut self, batch: Batch) -> Result<Batch, TransformError>;

    /// State to save after a batch, if the transform has any.
    fn state(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restore state saved by [`Transform::state`].
    fn restore(&mut self, _state: serde_json::Value) -> Result<(), TransformError> {
        Ok(())
    }
}

/// Writes rows unchanged.
#[derive(Debug, Default)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn apply(&mut self, batch: Batch) -> Result<Batch, TransformError> {
        Ok(batch)
    }
}

/// Keeps rows whose key column is greater than zero and stamps them with
/// the batch processing time and their source file.
///
/// The key compares numerically; strings are parsed, and a null or
/// unparseable key never passes.
#[derive(Debug)]
pub struct Cleanse {
    key_column: String,
    target: String,
}

impl Cleanse {
    pub fn new(key_column: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            key_column: key_column.into(),
            target: target.into(),
        }
    }

    fn passes(&self, row: &Row) -> bool {
        row.get(&self.key_column).as_f64().is_some_and(|key| key > 0.0)
    }
}

impl Transform for Cleanse {
    fn name(&self) -> &'static str {
        "cleanse"
    }

    fn apply(&mut self, batch: Batch) -> Result<Batch, TransformError> {
        let Batch { mut schema, rows } = batch;
        if rows.is_empty() && schema.fields().is_empty() {
            return Ok(Batch::default());
        }
        ensure!(
            schema.contains(&self.key_column),
            MissingColumnSnafu {
                transform: self.name(),
                column: &self.key_column,
            }
        );
        schema.upsert(Field::new(RECEIPT_TIME_COLUMN, DataType::Timestamp).required());
        schema.upsert(Field::new(SOURCE_FILE_COLUMN, DataType::String));

        let receipt_time = Value::Timestamp(Utc::now());
        let total = rows.len();
        let kept: Vec<Row> = rows
            .into_iter()
            .filter(|row| self.passes(row))
            .map(|mut row| {
                let source_file = row.origin.clone().map_or(Value::Null, Value::String);
                row.record
                    .insert(RECEIPT_TIME_COLUMN.to_string(), receipt_time.clone());
                row.record
                    .insert(SOURCE_FILE_COLUMN.to_string(), source_file);
                row
            })
            .collect();

        let dropped = (total - kept.len()) as u64;
        if dropped > 0 {
            emit!(RecordsDropped {
                count: dropped,
                reason: "invalid_key",
                target: self.target.clone(),
            });
        }
        Ok(Batch::new(schema, kept))
    }
}

/// Count of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCount {
    /// Group key, `None` for rows whose group column is null.
    pub key: Option<String>,
    pub count: i64,
}

/// Running count of rows per group, emitted in full after every batch.
///
/// Counting follows `count(column)`: rows with a null group key form their
/// own group with a count of zero.
#[derive(Debug)]
pub struct CountBy {
    group_by: String,
    count_column: String,
    counts: BTreeMap<Option<String>, i64>,
}

impl CountBy {
    pub fn new(group_by: impl Into<String>, count_column: impl Into<String>) -> Self {
        Self {
            group_by: group_by.into(),
            count_column: count_column.into(),
            counts: BTreeMap::new(),
        }
    }

    /// Current counts ordered by key, null first.
    pub fn counts(&self) -> Vec<GroupCount> {
        self.counts
            .iter()
            .map(|(key, count)| GroupCount {
                key: key.clone(),
                count: *count,
            })
            .collect()
    }

    fn output_schema(&self) -> Schema {
        Schema::new(vec![
            Field::new(self.group_by.clone(), DataType::String),
            Field::new(self.count_column.clone(), DataType::Int64).required(),
        ])
    }
}

impl Transform for CountBy {
    fn name(&self) -> &'static str {
        "count_by"
    }

    fn apply(&mut self, batch: Batch) -> Result<Batch, TransformError> {
        if !batch.rows.is_empty() {
            ensure!(
                batch.schema.contains(&self.group_by),
                MissingColumnSnafu {
                    transform: self.name(),
                    column: &self.group_by,
                }
            );
        }

        for row in &batch.rows {
            let key = row.get(&self.group_by).group_key();
            let increment = i64::from(key.is_some());
            *self.counts.entry(key).or_insert(0) += increment;
        }

        let rows = self
            .counts
            .iter()
            .map(|(key, count)| {
                let mut record = Record::new();
                record.insert(
                    self.group_by.clone(),
                    key.clone().map_or(Value::Null, Value::String),
                );
                record.insert(self.count_column.clone(), Value::Int64(*count));
                Row::new(record, None)
            })
            .collect();
        Ok(Batch::new(self.output_schema(), rows))
    }

    fn state(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self.counts()).ok()
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<(), TransformError> {
        let counts: Vec<GroupCount> =
            serde_json::from_value(state).context(DecodeStateSnafu {
                transform: self.name(),
            })?;
        self.counts = counts.into_iter().map(|g| (g.key, g.count)).collect();
        Ok(())
    }
}
