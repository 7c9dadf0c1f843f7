//! Configuration for the medallion pipeline.
//!
//! A single YAML file describes where CSV files arrive, where tables and
//! checkpoints live, and how each stage behaves:
//!
//! ```yaml
//! paths:
//!   source: ${LAB_ROOT}/customers
//!   warehouse: ${LAB_ROOT}/warehouse
//!   checkpoints: ${LAB_ROOT}/checkpoints
//! ingest:
//!   mode: permissive
//! trigger:
//!   poll_interval_ms: 5000
//! ```

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use medallion_core::error::{
    ConfigError, DuplicateTableNameSnafu, EmptyColumnSnafu, EmptyPathSnafu,
    EmptyTableNameSnafu, InvalidDelimiterSnafu,
};
use medallion_core::metrics::DEFAULT_METRICS_ADDR;

/// Checkpoint directory of the ingest stage.
pub const INGEST_CHECKPOINT: &str = "customers";
/// Checkpoint directory of the cleanse stage.
pub const CLEANSE_CHECKPOINT: &str = "silver";
/// Checkpoint directory of the aggregate stage.
pub const AGGREGATE_CHECKPOINT: &str = "customer_counts";

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    #[serde(default)]
    pub tables: TablesConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub cleanse: CleanseConfig,
    #[serde(default)]
    pub aggregate: AggregateConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Directory watched for new CSV files.
    pub source: String,
    /// Root under which every table is stored.
    pub warehouse: String,
    /// Root under which every stage keeps its checkpoint.
    pub checkpoints: String,
}

/// Table names for the three tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TablesConfig {
    #[serde(default = "default_bronze")]
    pub bronze: String,
    #[serde(default = "default_silver")]
    pub silver: String,
    #[serde(default = "default_gold")]
    pub gold: String,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            bronze: default_bronze(),
            silver: default_silver(),
            gold: default_gold(),
        }
    }
}

fn default_bronze() -> String {
    "bronze".to_string()
}

fn default_silver() -> String {
    "silver".to_string()
}

fn default_gold() -> String {
    "gold_customer_count_by_state".to_string()
}

/// How a row that does not match the schema is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    /// Keep the row; bad values become null and are saved in the rescue column.
    #[default]
    Permissive,
    /// Drop the row.
    DropMalformed,
    /// Fail the stage.
    FailFast,
}

/// How columns that are not in the schema are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaEvolutionMode {
    /// Append new columns to the schema (default).
    #[default]
    AddNewColumns,
    /// Keep the schema; new column values go to the rescue column.
    Rescue,
    /// Fail the stage.
    FailOnNewColumns,
}

/// Ingest stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    /// File extension of source files.
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Field delimiter.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Whether the first line of each file is a header row.
    #[serde(default = "default_true")]
    pub header: bool,
    /// Infer column types; when false every column is a string.
    #[serde(default = "default_true")]
    pub infer_column_types: bool,
    /// Maximum number of files sampled for schema inference.
    #[serde(default = "default_sample_files")]
    pub schema_sample_files: usize,
    /// Maximum number of rows sampled for schema inference.
    #[serde(default = "default_sample_rows")]
    pub schema_sample_rows: usize,
    #[serde(default)]
    pub schema_evolution: SchemaEvolutionMode,
    #[serde(default)]
    pub mode: ParseMode,
    /// Upper bound on files per micro-batch.
    #[serde(default = "default_max_files_per_trigger")]
    pub max_files_per_trigger: usize,
    /// Column holding values that did not fit the schema.
    #[serde(default = "default_rescued_data_column")]
    pub rescued_data_column: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            extension: default_extension(),
            delimiter: default_delimiter(),
            header: true,
            infer_column_types: true,
            schema_sample_files: default_sample_files(),
            schema_sample_rows: default_sample_rows(),
            schema_evolution: SchemaEvolutionMode::default(),
            mode: ParseMode::default(),
            max_files_per_trigger: default_max_files_per_trigger(),
            rescued_data_column: default_rescued_data_column(),
        }
    }
}

impl IngestConfig {
    /// Delimiter as a byte. Only valid after [`PipelineConfig::validate`].
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter.as_bytes().first().copied().unwrap_or(b',')
    }
}

fn default_extension() -> String {
    "csv".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sample_files() -> usize {
    50
}

fn default_sample_rows() -> usize {
    1000
}

fn default_max_files_per_trigger() -> usize {
    1000
}

fn default_rescued_data_column() -> String {
    "_rescued_data".to_string()
}

/// Cleanse stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanseConfig {
    /// Rows pass only if this column is greater than zero.
    #[serde(default = "default_key_column")]
    pub key_column: String,
}

impl Default for CleanseConfig {
    fn default() -> Self {
        Self {
            key_column: default_key_column(),
        }
    }
}

fn default_key_column() -> String {
    "postcode".to_string()
}

/// Aggregate stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateConfig {
    #[serde(default = "default_group_by")]
    pub group_by: String,
    #[serde(default = "default_count_column")]
    pub count_column: String,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            group_by: default_group_by(),
            count_column: default_count_column(),
        }
    }
}

fn default_group_by() -> String {
    "state".to_string()
}

fn default_count_column() -> String {
    "customer_count".to_string()
}

/// When stages look for new data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    /// Wait between polls that found no new data.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Process everything available, then stop.
    #[serde(default)]
    pub available_now: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            available_now: false,
        }
    }
}

impl TriggerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval_ms() -> u64 {
    5000
}

/// Settings shared by every stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Maximum random jitter added to each poll wait, in seconds.
    #[serde(default)]
    pub poll_jitter_secs: u64,
}

/// Prometheus endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP listener.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    DEFAULT_METRICS_ADDR.to_string()
}

impl PipelineConfig {
    /// Configuration with default settings for the given locations.
    pub fn new(
        source: impl Into<String>,
        warehouse: impl Into<String>,
        checkpoints: impl Into<String>,
    ) -> Self {
        Self {
            paths: PathsConfig {
                source: source.into(),
                warehouse: warehouse.into(),
                checkpoints: checkpoints.into(),
            },
            tables: TablesConfig::default(),
            ingest: IngestConfig::default(),
            cleanse: CleanseConfig::default(),
            aggregate: AggregateConfig::default(),
            trigger: TriggerConfig::default(),
            global: GlobalConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = medallion_core::parse_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = medallion_core::load_yaml_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("paths.source", &self.paths.source),
            ("paths.warehouse", &self.paths.warehouse),
            ("paths.checkpoints", &self.paths.checkpoints),
        ] {
            ensure!(!value.trim().is_empty(), EmptyPathSnafu { name });
        }

        let mut seen = HashSet::new();
        for (tier, name) in [
            ("bronze", &self.tables.bronze),
            ("silver", &self.tables.silver),
            ("gold", &self.tables.gold),
        ] {
            ensure!(!name.trim().is_empty(), EmptyTableNameSnafu { tier });
            ensure!(
                seen.insert(name.as_str()),
                DuplicateTableNameSnafu { name: name.as_str() }
            );
        }

        for (name, value) in [
            ("ingest.rescued_data_column", &self.ingest.rescued_data_column),
            ("cleanse.key_column", &self.cleanse.key_column),
            ("aggregate.group_by", &self.aggregate.group_by),
            ("aggregate.count_column", &self.aggregate.count_column),
        ] {
            ensure!(!value.trim().is_empty(), EmptyColumnSnafu { name });
        }

        let delimiter = &self.ingest.delimiter;
        ensure!(
            delimiter.len() == 1 && delimiter.is_ascii(),
            InvalidDelimiterSnafu {
                delimiter: delimiter.as_str()
            }
        );

        Ok(())
    }

    /// Checkpoint directories of every stage.
    pub fn checkpoint_dirs() -> [&'static str; 3] {
        [INGEST_CHECKPOINT, CLEANSE_CHECKPOINT, AGGREGATE_CHECKPOINT]
    }

    /// Names of every table the pipeline writes.
    pub fn table_names(&self) -> [&str; 3] {
        [
            self.tables.bronze.as_str(),
            self.tables.silver.as_str(),
            self.tables.gold.as_str(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
paths:
  source: /lab/customers
  warehouse: /lab/warehouse
  checkpoints: /lab/checkpoints
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = PipelineConfig::from_yaml_str(MINIMAL).unwrap();

        assert_eq!(config.tables.bronze, "bronze");
        assert_eq!(config.tables.gold, "gold_customer_count_by_state");
        assert_eq!(config.ingest.mode, ParseMode::Permissive);
        assert_eq!(
            config.ingest.schema_evolution,
            SchemaEvolutionMode::AddNewColumns
        );
        assert_eq!(config.ingest.max_files_per_trigger, 1000);
        assert_eq!(config.cleanse.key_column, "postcode");
        assert_eq!(config.aggregate.group_by, "state");
        assert_eq!(config.trigger.poll_interval(), Duration::from_secs(5));
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
paths:
  source: /lab/customers
  warehouse: memory://lab/warehouse
  checkpoints: memory://lab/checkpoints
tables:
  gold: counts
ingest:
  delimiter: ";"
  mode: drop_malformed
  schema_evolution: fail_on_new_columns
  max_files_per_trigger: 2
trigger:
  poll_interval_ms: 100
  available_now: true
global:
  poll_jitter_secs: 3
metrics:
  enabled: true
  address: 127.0.0.1:9100
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.tables.gold, "counts");
        assert_eq!(config.ingest.delimiter_byte(), b';');
        assert_eq!(config.ingest.mode, ParseMode::DropMalformed);
        assert_eq!(
            config.ingest.schema_evolution,
            SchemaEvolutionMode::FailOnNewColumns
        );
        assert!(config.trigger.available_now);
        assert_eq!(config.global.poll_jitter_secs, 3);
        assert_eq!(config.metrics.address, "127.0.0.1:9100");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = format!("{MINIMAL}extra: 1\n");
        let err = PipelineConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::YamlParse { .. }));
    }

    #[test]
    fn test_empty_path_rejected() {
        let mut config = PipelineConfig::new("/in", "/wh", "/cp");
        config.paths.warehouse = " ".to_string();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyPath { name } if name == "paths.warehouse"));
    }

    #[test]
    fn test_duplicate_table_names_rejected() {
        let mut config = PipelineConfig::new("/in", "/wh", "/cp");
        config.tables.silver = "bronze".to_string();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTableName { .. }));
    }

    #[test]
    fn test_multi_char_delimiter_rejected() {
        let mut config = PipelineConfig::new("/in", "/wh", "/cp");
        config.ingest.delimiter = "||".to_string();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDelimiter { .. }));
    }

    #[test]
    fn test_paths_interpolated_from_env() {
        let yaml = r#"
paths:
  source: ${MEDALLION_TEST_LAB:-/tmp/lab}/customers
  warehouse: ${MEDALLION_TEST_LAB:-/tmp/lab}/warehouse
  checkpoints: ${MEDALLION_TEST_LAB:-/tmp/lab}/checkpoints
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.paths.source, "/tmp/lab/customers");
    }
}
