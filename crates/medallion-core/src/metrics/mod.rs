//! Metrics and observability infrastructure.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `init`: Prometheus exporter installation

pub mod events;

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use snafu::prelude::*;
use tracing::info;

use crate::error::{AddressParseSnafu, MetricsError, PrometheusInitSnafu};

/// Default metrics address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Default histogram buckets for duration metrics (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Macro for emitting metric events (Vector-style pattern).
///
/// # Example
///
/// ```ignore
/// use medallion_core::emit;
/// use medallion_core::metrics::events::RecordsRead;
///
/// emit!(RecordsRead { count: 100, target: "ingest".into() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

/// Install the Prometheus exporter with an HTTP listener on `address`.
///
/// Must be called from within a tokio runtime. Without a call to this
/// function every emitted event is a no-op.
pub fn init(address: &str) -> Result<(), MetricsError> {
    let addr: SocketAddr = address.parse().context(AddressParseSnafu { address })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install()
        .context(PrometheusInitSnafu)?;

    info!(%addr, "Metrics exporter started");
    Ok(())
}
