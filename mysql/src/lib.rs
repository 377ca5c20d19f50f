//! MySQL source metadata shared by every crate of the workspace.
//!
//! Provides table and column metadata as the binlog decoder sees it, binlog positions, raw
//! binlog values, and the sqlx helpers that load metadata from `information_schema`.

pub mod connection;
pub mod schema;
pub mod types;
