use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};

static REGISTER_METRICS: Once = Once::new();

/// Counter of native write operations (commands, bulk items, messages) sent to a destination.
pub const ETL_DESTINATION_OPERATIONS_TOTAL: &str = "etl_destination_operations_total";

/// Counter of payload bytes sent to a destination.
pub const ETL_DESTINATION_EGRESS_BYTES_TOTAL: &str = "etl_destination_egress_bytes_total";

/// Histogram of the time spent in one destination round-trip.
pub const ETL_DESTINATION_REQUEST_DURATION_SECONDS: &str =
    "etl_destination_request_duration_seconds";

/// Label for the processing type, `stream` or `export`.
pub const PROCESSING_TYPE_LABEL: &str = "processing_type";

/// Register metrics emitted by the destinations. It is safe to call
/// this method multiple times. It is guaranteed to register the
/// metrics only once.
pub(crate) fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            ETL_DESTINATION_OPERATIONS_TOTAL,
            Unit::Count,
            "Native write operations sent to the destination"
        );

        describe_counter!(
            ETL_DESTINATION_EGRESS_BYTES_TOTAL,
            Unit::Bytes,
            "Payload bytes sent to the destination"
        );

        describe_histogram!(
            ETL_DESTINATION_REQUEST_DURATION_SECONDS,
            Unit::Seconds,
            "Time taken by one destination round-trip"
        );
    });
}
