//! Runtime state of running pipelines.
//!
//! Every pipeline owns one [`runtime::PipelineRuntime`] record holding its status, intake
//! counters, last persisted position and bulk export progress. Records live in a
//! [`registry::RuntimeRegistry`] so administrative callers can read snapshots without touching
//! the pipeline itself.

pub mod registry;
pub mod runtime;

pub use registry::RuntimeRegistry;
pub use runtime::{ExportProgress, PipelineRuntime, PipelineStatus, RuntimeSnapshot};
