//! Row model shared by every stage.
//!
//! Records are ordered column maps of typed [`Value`]s. On disk, rows are
//! stored as one JSON object per line and decoded back against the table
//! [`Schema`].

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Column data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Int64,
    Float64,
    String,
    Timestamp,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "boolean",
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::String => "string",
            DataType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Field {
    /// Create a nullable field.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    /// Mark the field as non-nullable.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Ordered list of fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Replace a field of the same name, or append it.
    pub fn upsert(&mut self, field: Field) {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }

    /// Union of two schemas, keeping this schema's column order.
    ///
    /// Columns only in `other` are appended as nullable. Fails with the
    /// offending column when the same name has different types.
    pub fn merge(&self, other: &Schema) -> Result<Schema, String> {
        let mut merged = self.clone();
        for field in &other.fields {
            match merged.fields.iter_mut().find(|f| f.name == field.name) {
                Some(existing) if existing.data_type != field.data_type => {
                    return Err(format!(
                        "column '{}' is {} in the table but {} in the batch",
                        field.name, existing.data_type, field.data_type
                    ));
                }
                Some(existing) => existing.nullable |= field.nullable,
                None => merged.fields.push(Field {
                    nullable: true,
                    ..field.clone()
                }),
            }
        }
        Ok(merged)
    }
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::String(_) => Some(DataType::String),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    /// Numeric view of the value.
    ///
    /// Strings are parsed as numbers; anything unparseable, booleans and
    /// timestamps have no numeric value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::Float64(v) if v.is_nan() => None,
            Value::Float64(v) => Some(*v),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| !v.is_nan()),
            _ => None,
        }
    }

    /// String form used as a grouping key. Null has no key.
    pub fn group_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Parse text as the given type. Returns `None` if the text does not fit.
    pub fn parse(text: &str, data_type: DataType) -> Option<Value> {
        let trimmed = text.trim();
        match data_type {
            DataType::String => Some(Value::String(text.to_string())),
            DataType::Boolean => parse_bool(trimmed).map(Value::Boolean),
            DataType::Int64 => trimmed.parse::<i64>().ok().map(Value::Int64),
            DataType::Float64 => parse_float(trimmed).map(Value::Float64),
            DataType::Timestamp => parse_timestamp(trimmed).map(Value::Timestamp),
        }
    }

    /// Encode for a data file.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(v) => serde_json::Value::Bool(*v),
            Value::Int64(v) => serde_json::Value::from(*v),
            Value::Float64(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(v) => serde_json::Value::String(v.clone()),
            Value::Timestamp(v) => {
                serde_json::Value::String(v.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
        }
    }

    /// Decode a data file value against its column type.
    pub fn from_json(json: &serde_json::Value, data_type: DataType) -> Value {
        use serde_json::Value as Json;
        match (json, data_type) {
            (Json::Null, _) => Value::Null,
            (Json::Bool(v), DataType::Boolean) => Value::Boolean(*v),
            (Json::Number(n), DataType::Int64) => n.as_i64().map_or(Value::Null, Value::Int64),
            (Json::Number(n), DataType::Float64) => n.as_f64().map_or(Value::Null, Value::Float64),
            (Json::String(s), DataType::String) => Value::String(s.clone()),
            (Json::String(s), DataType::Timestamp) => {
                parse_timestamp(s).map_or(Value::Null, Value::Timestamp)
            }
            (Json::String(s), other) => Value::parse(s, other).unwrap_or(Value::Null),
            (other, DataType::String) => Value::String(other.to_string()),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::Timestamp(v) => f.write_str(&v.to_rfc3339_opts(SecondsFormat::Micros, true)),
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    if text.eq_ignore_ascii_case("true") {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

// Rejects "inf" and "nan" spellings that `f64::from_str` would accept.
fn parse_float(text: &str) -> Option<f64> {
    if !text.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse an RFC 3339 timestamp, or a naive `YYYY-MM-DD HH:MM:SS[.f]` as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

/// Ordered column → value map.
pub type Record = IndexMap<String, Value>;

/// A record together with the file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub record: Record,
    pub origin: Option<String>,
}

impl Row {
    pub fn new(record: Record, origin: Option<String>) -> Self {
        Self { record, origin }
    }

    pub fn get(&self, column: &str) -> &Value {
        self.record.get(column).unwrap_or(&Value::Null)
    }
}

/// Encode a record as a JSON object in schema column order.
pub fn encode_record(record: &Record, schema: &Schema) -> serde_json::Value {
    let object = schema
        .fields()
        .iter()
        .map(|field| {
            let value = record.get(&field.name).unwrap_or(&Value::Null);
            (field.name.clone(), value.to_json())
        })
        .collect();
    serde_json::Value::Object(object)
}

/// Decode a JSON object against a schema. Missing columns decode as null.
pub fn decode_record(json: &serde_json::Map<String, serde_json::Value>, schema: &Schema) -> Record {
    schema
        .fields()
        .iter()
        .map(|field| {
            let value = json
                .get(&field.name)
                .map_or(Value::Null, |v| Value::from_json(v, field.data_type));
            (field.name.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn customers_schema() -> Schema {
        Schema::new(vec![
            Field::new("postcode", DataType::Int64),
            Field::new("state", DataType::String),
        ])
    }

    #[test]
    fn test_parse_by_type() {
        assert_eq!(Value::parse(" 42 ", DataType::Int64), Some(Value::Int64(42)));
        assert_eq!(Value::parse("4.5", DataType::Float64), Some(Value::Float64(4.5)));
        assert_eq!(Value::parse("TRUE", DataType::Boolean), Some(Value::Boolean(true)));
        assert_eq!(Value::parse("abc", DataType::Int64), None);
        assert_eq!(Value::parse("inf", DataType::Float64), None);
        assert_eq!(
            Value::parse(" CA", DataType::String),
            Some(Value::String(" CA".to_string()))
        );
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01 12:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T14:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_as_f64_parses_strings() {
        assert_eq!(Value::String("12345".into()).as_f64(), Some(12345.0));
        assert_eq!(Value::String("n/a".into()).as_f64(), None);
        assert_eq!(Value::Int64(-1).as_f64(), Some(-1.0));
        assert_eq!(Value::Null.as_f64(), None);
        assert_eq!(Value::Boolean(true).as_f64(), None);
    }

    #[test]
    fn test_group_key() {
        assert_eq!(Value::String("CA".into()).group_key().as_deref(), Some("CA"));
        assert_eq!(Value::Int64(7).group_key().as_deref(), Some("7"));
        assert_eq!(Value::Null.group_key(), None);
    }

    #[test]
    fn test_record_survives_data_file_encoding() {
        let schema = Schema::new(vec![
            Field::new("postcode", DataType::Int64),
            Field::new("state", DataType::String),
            Field::new("receipt_time", DataType::Timestamp),
            Field::new("score", DataType::Float64),
        ]);
        let mut record = Record::new();
        record.insert("postcode".into(), Value::Int64(12345));
        record.insert("state".into(), Value::String("CA".into()));
        record.insert(
            "receipt_time".into(),
            Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
        );
        record.insert("score".into(), Value::Null);

        let json = encode_record(&record, &schema);
        let decoded = decode_record(json.as_object().unwrap(), &schema);

        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_fills_missing_columns_with_null() {
        let json = serde_json::json!({"postcode": 1});
        let decoded = decode_record(json.as_object().unwrap(), &customers_schema());
        assert_eq!(decoded["state"], Value::Null);
    }

    #[test]
    fn test_merge_appends_new_columns() {
        let table = customers_schema();
        let batch = Schema::new(vec![
            Field::new("postcode", DataType::Int64),
            Field::new("email", DataType::String).required(),
        ]);

        let merged = table.merge(&batch).unwrap();
        let names: Vec<_> = merged.names().collect();
        assert_eq!(names, vec!["postcode", "state", "email"]);
        assert!(merged.field("email").unwrap().nullable);
    }

    #[test]
    fn test_merge_rejects_type_change() {
        let table = customers_schema();
        let batch = Schema::new(vec![Field::new("postcode", DataType::String)]);

        let err = table.merge(&batch).unwrap_err();
        assert!(err.contains("postcode"));
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut schema = customers_schema();
        schema.upsert(Field::new("state", DataType::Int64));
        schema.upsert(Field::new("source_file", DataType::String));

        assert_eq!(schema.fields()[1].data_type, DataType::Int64);
        assert_eq!(schema.fields().len(), 3);
    }
}
