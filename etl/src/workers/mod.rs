//! Long running tasks of a pipeline.
//!
//! Each pipeline runs one binlog [`reader`] and one flush loop ([`stream`]). Both are plain
//! tokio tasks owned by the pipeline supervisor through their handles.

pub mod reader;
pub mod stream;
