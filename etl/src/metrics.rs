//! Metrics definitions for pipeline monitoring.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

/// Label for pipeline ID in metrics.
pub const PIPELINE_ID_LABEL: &str = "pipeline_id";

/// Label for the row action (`insert`, `update`, `delete`).
pub const ACTION_LABEL: &str = "action";

/// Label for the destination name.
pub const DESTINATION_LABEL: &str = "destination";

/// Label for table name in metrics.
pub const TABLE_NAME_LABEL: &str = "table_name";

/// Counter of row events taken from the binlog source.
pub const ETL_EVENTS_RECEIVED_TOTAL: &str = "etl_events_received_total";

/// Histogram of destination write latency for one flushed batch.
pub const ETL_BATCH_WRITE_DURATION_SECONDS: &str = "etl_batch_write_duration_seconds";

/// Histogram of the number of rows per flushed batch.
pub const ETL_BATCH_SIZE: &str = "etl_batch_size";

/// Counter of persisted binlog positions.
pub const ETL_CHECKPOINT_SAVES_TOTAL: &str = "etl_checkpoint_saves_total";

/// Counter of destination faults observed by the flush loop.
pub const ETL_SINK_FAULTS_TOTAL: &str = "etl_sink_faults_total";

/// Counter of rows written by the bulk export.
pub const ETL_EXPORT_ROWS_TOTAL: &str = "etl_export_rows_total";

/// Gauge holding the numeric code of the pipeline status.
pub const ETL_PIPELINE_STATUS: &str = "etl_pipeline_status";

static REGISTER_METRICS: Once = Once::new();

/// Describes every metric once so exporters render help text and units.
pub fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            ETL_EVENTS_RECEIVED_TOTAL,
            Unit::Count,
            "Row events received from the binlog source, labeled by action."
        );
        describe_histogram!(
            ETL_BATCH_WRITE_DURATION_SECONDS,
            Unit::Seconds,
            "Time spent writing one batch to the destination."
        );
        describe_histogram!(
            ETL_BATCH_SIZE,
            Unit::Count,
            "Rows contained in one flushed batch."
        );
        describe_counter!(
            ETL_CHECKPOINT_SAVES_TOTAL,
            Unit::Count,
            "Binlog positions persisted to the checkpoint store."
        );
        describe_counter!(
            ETL_SINK_FAULTS_TOTAL,
            Unit::Count,
            "Destination write failures that moved the pipeline into the fault state."
        );
        describe_counter!(
            ETL_EXPORT_ROWS_TOTAL,
            Unit::Count,
            "Rows written by the bulk export."
        );
        describe_gauge!(
            ETL_PIPELINE_STATUS,
            Unit::Count,
            "Current pipeline status code."
        );
    });
}
