//! medallion-core: Shared components for the medallion pipeline.
//!
//! This crate holds the plumbing that every pipeline stage relies on:
//!
//! - `storage/` - Object storage abstraction (local filesystem, in-memory)
//! - `metrics/` - Internal events emitted into the `metrics` facade
//! - `config/` - Environment variable interpolation for YAML configs
//! - `polling` - Generic polling loop trait and runner
//! - `signal` - Signal handling for graceful shutdown
//! - `error` - Common error types
//! - `tracing` - Subscriber initialization

pub mod config;
pub mod error;
pub mod metrics;
pub mod polling;
pub mod signal;
pub mod storage;
pub mod tracing;

// Re-export commonly used items
pub use config::{InterpolationResult, interpolate, load_yaml_file, parse_yaml};
pub use error::{ConfigError, MetricsError, StorageError};
pub use metrics::init as init_metrics;
pub use polling::{IterationResult, PollingProcessor, random_jitter, run_polling_loop};
pub use signal::shutdown_signal;
pub use storage::{StorageProvider, StorageProviderRef};
pub use tracing::init_tracing;
