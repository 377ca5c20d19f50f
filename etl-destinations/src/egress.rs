//! Egress accounting shared by the destination adapters.
//!
//! Every successful round-trip is logged with `egress_metric = true` so log aggregators can
//! filter on it, and mirrored into the destination counters.

use std::time::Duration;

use etl::metrics::DESTINATION_LABEL;
use metrics::{counter, histogram};
use tracing::info;

use crate::metrics::{
    ETL_DESTINATION_EGRESS_BYTES_TOTAL, ETL_DESTINATION_OPERATIONS_TOTAL,
    ETL_DESTINATION_REQUEST_DURATION_SECONDS, PROCESSING_TYPE_LABEL, register_metrics,
};

/// Processing type for rows coming from the binlog stream.
pub const PROCESSING_TYPE_STREAM: &str = "stream";

/// Processing type for pages of a bulk export.
pub const PROCESSING_TYPE_EXPORT: &str = "export";

/// Records one completed destination round-trip.
pub fn log_processed_bytes(
    destination_type: &'static str,
    processing_type: &'static str,
    operations: usize,
    bytes_sent: u64,
    elapsed: Duration,
) {
    register_metrics();

    info!(
        egress_metric = true,
        destination_type,
        processing_type,
        operations,
        bytes_sent,
        "etl_processed_bytes"
    );

    counter!(
        ETL_DESTINATION_OPERATIONS_TOTAL,
        DESTINATION_LABEL => destination_type,
        PROCESSING_TYPE_LABEL => processing_type,
    )
    .increment(operations as u64);
    counter!(
        ETL_DESTINATION_EGRESS_BYTES_TOTAL,
        DESTINATION_LABEL => destination_type,
        PROCESSING_TYPE_LABEL => processing_type,
    )
    .increment(bytes_sent);
    histogram!(
        ETL_DESTINATION_REQUEST_DURATION_SECONDS,
        DESTINATION_LABEL => destination_type,
    )
    .record(elapsed.as_secs_f64());
}
