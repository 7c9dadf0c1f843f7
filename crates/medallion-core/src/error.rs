//! Common error types shared by the medallion crates.
//!
//! This module defines error types for storage, configuration and metrics
//! operations.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            StorageError::Io { source } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if a conditional put lost against an existing object.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore {
                source: object_store::Error::AlreadyExists { .. }
            }
        )
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A required path is empty.
    #[snafu(display("Path '{name}' cannot be empty"))]
    EmptyPath { name: String },

    /// A table name is empty.
    #[snafu(display("Table name for the {tier} tier cannot be empty"))]
    EmptyTableName { tier: String },

    /// Two tiers share the same table name.
    #[snafu(display("Table name '{name}' is used by more than one tier"))]
    DuplicateTableName { name: String },

    /// A column reference is empty.
    #[snafu(display("Column '{name}' cannot be empty"))]
    EmptyColumn { name: String },

    /// Delimiter must be a single ASCII character.
    #[snafu(display("Delimiter must be a single ASCII character, got '{delimiter}'"))]
    InvalidDelimiter { delimiter: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize the Prometheus exporter.
    #[snafu(display("Failed to initialize Prometheus exporter"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Failed to parse the metrics listen address.
    #[snafu(display("Failed to parse metrics address '{address}': {source}"))]
    AddressParse {
        address: String,
        source: std::net::AddrParseError,
    },
}
