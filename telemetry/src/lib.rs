//! Logging and metrics setup shared by the replicator binary and tests.

pub mod metrics;
pub mod tracing;
