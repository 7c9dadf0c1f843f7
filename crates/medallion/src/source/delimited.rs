//! Delimited text parsing.
//!
//! Files are read in two steps: [`read_raw`] splits a file into a header
//! and string fields, then [`parse_records`] types the fields against the
//! current schema, applying the configured parse mode.

use std::collections::HashSet;

use crate::config::ParseMode;
use crate::error::{MalformedRecordSnafu, SourceError};
use crate::record::{Record, Schema, Value};

/// Key under which rescued data records the file it came from.
pub const RESCUED_FILE_PATH_KEY: &str = "_file_path";

/// One data line of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based line number in the file.
    pub line: u64,
    pub fields: Vec<String>,
}

/// A file split into a header and string fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    pub header: Vec<String>,
    pub records: Vec<RawRecord>,
}

/// Split delimited text into a header and records.
///
/// Without a header row, columns are named `_c0`, `_c1`, ... after the
/// width of the first line. Invalid UTF-8 is replaced rather than rejected.
pub fn read_raw(bytes: &[u8], delimiter: u8, has_header: bool) -> Result<RawFile, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut lines = Vec::new();
    for result in reader.byte_records() {
        let record = result?;
        let line = record.position().map_or(0, |p| p.line());
        let fields = record
            .iter()
            .map(|field| String::from_utf8_lossy(field).into_owned())
            .collect();
        lines.push(RawRecord { line, fields });
    }

    let mut lines = lines.into_iter();
    let header = if has_header {
        lines
            .next()
            .map(|first| header_names(&first.fields))
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    let records: Vec<RawRecord> = lines.collect();

    let header = if has_header {
        header
    } else {
        let width = records.first().map_or(0, |r| r.fields.len());
        (0..width).map(positional_name).collect()
    };

    Ok(RawFile { header, records })
}

fn positional_name(index: usize) -> String {
    format!("_c{index}")
}

/// Clean up header names: strip a byte order mark, name blank columns by
/// position and suffix duplicates with their position.
fn header_names(fields: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    fields
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            let name = if index == 0 {
                raw.trim_start_matches('\u{feff}')
            } else {
                raw.as_str()
            };
            let name = if name.trim().is_empty() {
                positional_name(index)
            } else {
                name.to_string()
            };
            if seen.insert(name.clone()) {
                name
            } else {
                format!("{name}{index}")
            }
        })
        .collect()
}

/// Settings for typing raw records.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions<'a> {
    pub mode: ParseMode,
    pub rescued_data_column: &'a str,
}

/// Typed records of one file.
#[derive(Debug, Default)]
pub struct ParsedRecords {
    pub records: Vec<Record>,
    /// Records dropped in `drop_malformed` mode.
    pub dropped: u64,
    /// Records with a non-null rescued data column.
    pub rescued: u64,
}

/// Type the records of a file against `schema`.
///
/// Values that do not parse as their column type, fields beyond the header
/// and columns missing from the schema are collected into the rescued data
/// column as a JSON object, together with `file_url`. A record with a bad
/// value or the wrong number of fields is malformed and handled per
/// [`ParseMode`]; short records are padded with nulls.
pub fn parse_records(
    file: &RawFile,
    schema: &Schema,
    options: ParseOptions<'_>,
    file_url: &str,
) -> Result<ParsedRecords, SourceError> {
    let rescue_enabled = schema.contains(options.rescued_data_column);
    let mut parsed = ParsedRecords::default();

    for raw in &file.records {
        let mut record: Record = schema
            .names()
            .map(|name| (name.to_string(), Value::Null))
            .collect();
        let mut rescued = serde_json::Map::new();
        let mut malformed = (raw.fields.len() != file.header.len()).then(|| {
            format!(
                "expected {} fields, found {}",
                file.header.len(),
                raw.fields.len()
            )
        });

        for (index, text) in raw.fields.iter().enumerate() {
            let Some(name) = file.header.get(index) else {
                if !text.is_empty() {
                    rescued.insert(positional_name(index), text.clone().into());
                }
                continue;
            };
            if name == options.rescued_data_column {
                continue;
            }
            let Some(field) = schema.field(name) else {
                if !text.is_empty() {
                    rescued.insert(name.clone(), text.clone().into());
                }
                continue;
            };
            if text.is_empty() {
                continue;
            }
            match Value::parse(text, field.data_type) {
                Some(value) => {
                    record.insert(name.clone(), value);
                }
                None => {
                    malformed.get_or_insert_with(|| {
                        format!(
                            "'{text}' is not a valid {} for column '{name}'",
                            field.data_type
                        )
                    });
                    rescued.insert(name.clone(), text.clone().into());
                }
            }
        }

        if let Some(message) = malformed {
            match options.mode {
                ParseMode::FailFast => {
                    return MalformedRecordSnafu {
                        path: file_url,
                        line: raw.line,
                        message,
                    }
                    .fail();
                }
                ParseMode::DropMalformed => {
                    parsed.dropped += 1;
                    continue;
                }
                ParseMode::Permissive => {}
            }
        }

        if rescue_enabled && !rescued.is_empty() {
            rescued.insert(RESCUED_FILE_PATH_KEY.to_string(), file_url.into());
            record.insert(
                options.rescued_data_column.to_string(),
                Value::String(serde_json::Value::Object(rescued).to_string()),
            );
            parsed.rescued += 1;
        }
        parsed.records.push(record);
    }

    Ok(parsed)
}
