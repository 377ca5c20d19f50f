//! Change data capture from MySQL binlogs into heterogeneous destinations.
//!
//! A [`pipeline::Pipeline`] subscribes to the binlog of one MySQL server, turns decoded row
//! events into [`types::RowEventRequest`]s through per-table rules, batches them and hands the
//! batches to a [`destination::Destination`]. Progress is checkpointed through a
//! [`store::PositionStore`] so a restarted pipeline resumes where the last acknowledged batch
//! ended. The [`export`] module copies whole tables through the same rules and destinations.

pub mod binlog;
pub mod concurrency;
pub mod conversions;
pub mod destination;
pub mod error;
pub mod export;
mod macros;
pub mod metrics;
pub mod pipeline;
pub mod rule;
pub mod script;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
