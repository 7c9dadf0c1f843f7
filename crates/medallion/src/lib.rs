//! medallion: an incremental bronze/silver/gold pipeline.
//!
//! CSV files arriving in a source directory flow through three streaming
//! stages, each with its own checkpoint:
//!
//! - ingest: new files into the append-only `bronze` table
//! - cleanse: new bronze rows with a positive key into `silver`, stamped
//!   with their receipt time and source file
//! - aggregate: new silver rows into per-state counts, rewritten in full
//!   into `gold_customer_count_by_state`
//!
//! Tables are directories of newline-delimited JSON files with a
//! transactional log; see [`table`]. Exactly-once delivery between stages
//! rests on the checkpoint protocol described in [`stage`].

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod sink;
pub mod source;
pub mod stage;
pub mod table;

// Re-export commonly used items
pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{Medallion, TeardownSummary};
pub use stage::{GroupCount, QueryProgress, QueryState, StreamingQuery, Trigger};
pub use table::{Catalog, Table};

pub use medallion_core::{init_metrics, init_tracing, shutdown_signal};
