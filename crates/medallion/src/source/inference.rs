//! Column type inference for delimited text.
//!
//! Each sampled value is classified on its own, then the per-column types
//! are widened: `Boolean` and `Int64` stay as they are, `Int64` and
//! `Float64` meet at `Float64`, `Timestamp` only stays a timestamp if every
//! value is one, and any other mix becomes `String`. Empty cells say
//! nothing about a column; a column that is empty everywhere is a string.

use indexmap::IndexMap;

use crate::record::{DataType, Field, Value, parse_timestamp};

use super::delimited::RawFile;

/// Type of a single non-empty cell, `None` for an empty one.
pub fn infer_value_type(text: &str) -> Option<DataType> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if Value::parse(trimmed, DataType::Boolean).is_some() {
        Some(DataType::Boolean)
    } else if Value::parse(trimmed, DataType::Int64).is_some() {
        Some(DataType::Int64)
    } else if Value::parse(trimmed, DataType::Float64).is_some() {
        Some(DataType::Float64)
    } else if parse_timestamp(trimmed).is_some() {
        Some(DataType::Timestamp)
    } else {
        Some(DataType::String)
    }
}

/// Narrowest type that holds values of both types.
pub fn widen(current: Option<DataType>, next: Option<DataType>) -> Option<DataType> {
    match (current, next) {
        (None, t) | (t, None) => t,
        (Some(a), Some(b)) if a == b => Some(a),
        (Some(DataType::Int64), Some(DataType::Float64))
        | (Some(DataType::Float64), Some(DataType::Int64)) => Some(DataType::Float64),
        _ => Some(DataType::String),
    }
}

/// Accumulates column types over sampled files.
#[derive(Debug)]
pub struct SchemaInferrer {
    columns: IndexMap<String, Option<DataType>>,
    infer_types: bool,
    rows_remaining: usize,
}

impl SchemaInferrer {
    pub fn new(infer_types: bool, max_rows: usize) -> Self {
        Self {
            columns: IndexMap::new(),
            infer_types,
            rows_remaining: max_rows,
        }
    }

    /// Add the columns of a file and sample its rows.
    ///
    /// Columns are kept in first-seen order across files.
    pub fn observe(&mut self, file: &RawFile) {
        for name in &file.header {
            self.columns.entry(name.clone()).or_insert(None);
        }
        if !self.infer_types {
            return;
        }

        let take = self.rows_remaining.min(file.records.len());
        for record in &file.records[..take] {
            for (name, text) in file.header.iter().zip(&record.fields) {
                if let Some(current) = self.columns.get_mut(name) {
                    *current = widen(*current, infer_value_type(text));
                }
            }
        }
        self.rows_remaining -= take;
    }

    /// Inferred fields, all nullable.
    pub fn finish(self) -> Vec<Field> {
        let infer_types = self.infer_types;
        self.columns
            .into_iter()
            .map(|(name, data_type)| {
                let data_type = match data_type {
                    Some(t) if infer_types => t,
                    _ => DataType::String,
                };
                Field::new(name, data_type)
            })
            .collect()
    }
}
