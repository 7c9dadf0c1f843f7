//! Table log actions.
//!
//! A log entry is newline-delimited JSON, one externally tagged action per
//! line (`{"add": {...}}`), in the layout popularised by Delta Lake:
//! - `metaData` sets the table schema
//! - `add` / `remove` change the set of active data files
//! - `txn` records the last micro-batch a streaming writer committed
//! - `commitInfo` describes the operation

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::record::Schema;

/// A single log action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    MetaData(MetaData),
    Add(Add),
    Remove(Remove),
    Txn(Txn),
    CommitInfo(CommitInfo),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    pub id: String,
    pub schema: Schema,
    pub created_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Add {
    /// Data file path relative to the table root.
    pub path: String,
    pub size: u64,
    pub num_records: u64,
    /// URL of the file the rows were read from, if they came from one file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    pub modification_time: i64,
    pub data_change: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remove {
    pub path: String,
    pub deletion_timestamp: i64,
    pub data_change: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Txn {
    pub app_id: String,
    pub version: u64,
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub timestamp: i64,
    pub operation: String,
    #[serde(default)]
    pub operation_parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_version: Option<u64>,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Create a metaData action for a new or widened schema.
pub fn create_metadata_action(id: &str, schema: Schema) -> Action {
    Action::MetaData(MetaData {
        id: id.to_string(),
        schema,
        created_time: now_millis(),
    })
}

/// Create an add action for a freshly written data file.
pub fn create_add_action(
    path: &str,
    size: u64,
    num_records: u64,
    source_file: Option<String>,
) -> Action {
    Action::Add(Add {
        path: path.trim_start_matches('/').to_string(),
        size,
        num_records,
        source_file,
        modification_time: now_millis(),
        data_change: true,
    })
}

/// Create a remove action that logically deletes a data file.
pub fn create_remove_action(path: &str) -> Action {
    Action::Remove(Remove {
        path: path.to_string(),
        deletion_timestamp: now_millis(),
        data_change: true,
    })
}

/// Create a txn action recording `batch_id` as committed by `app_id`.
pub fn create_txn_action(app_id: &str, batch_id: u64) -> Action {
    Action::Txn(Txn {
        app_id: app_id.to_string(),
        version: batch_id,
        last_updated: now_millis(),
    })
}

/// Create the commitInfo action that leads every log entry.
pub fn create_commit_info(
    operation: &str,
    parameters: BTreeMap<String, String>,
    read_version: Option<u64>,
) -> Action {
    Action::CommitInfo(CommitInfo {
        timestamp: now_millis(),
        operation: operation.to_string(),
        operation_parameters: parameters,
        read_version,
    })
}

/// Serialize actions into a log entry.
pub fn encode_actions(actions: &[Action]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for action in actions {
        out.push_str(&serde_json::to_string(action)?);
        out.push('\n');
    }
    Ok(out)
}

/// Parse a log entry. Blank lines are ignored.
pub fn decode_actions(entry: &[u8]) -> Result<Vec<Action>, serde_json::Error> {
    serde_json::Deserializer::from_slice(entry)
        .into_iter::<Action>()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DataType, Field};

    #[test]
    fn test_create_add_action_strips_leading_slash() {
        match create_add_action("/part-00000-a.ndjson", 10, 2, None) {
            Action::Add(add) => {
                assert_eq!(add.path, "part-00000-a.ndjson");
                assert_eq!(add.num_records, 2);
                assert!(add.data_change);
            }
            other => panic!("Expected Add action, got {other:?}"),
        }
    }

    #[test]
    fn test_actions_are_externally_tagged() {
        let line = serde_json::to_string(&create_txn_action("query-1", 4)).unwrap();
        assert!(line.starts_with(r#"{"txn":{"appId":"query-1","version":4"#));
    }

    #[test]
    fn test_log_entry_keeps_action_order() {
        let actions = vec![
            create_commit_info("STREAMING UPDATE", BTreeMap::new(), Some(0)),
            create_metadata_action(
                "table-id",
                Schema::new(vec![Field::new("state", DataType::String)]),
            ),
            create_add_action(
                "part-00001-b.ndjson",
                42,
                3,
                Some("file:///lab/customers/a.csv".to_string()),
            ),
            create_remove_action("part-00000-a.ndjson"),
            create_txn_action("query-1", 1),
        ];

        let entry = encode_actions(&actions).unwrap();
        assert_eq!(entry.lines().count(), 5);

        let decoded = decode_actions(entry.as_bytes()).unwrap();
        assert_eq!(decoded, actions);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_actions(b"{\"add\": 5}\n").is_err());
    }
}
