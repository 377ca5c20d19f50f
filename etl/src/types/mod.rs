//! Types flowing between the binlog handler, the flush loop and destinations.

mod event;

pub use event::{RowAction, RowEventRequest, RowsEvent};

/// Identifier of a pipeline, unique within a process.
pub type PipelineId = u64;
