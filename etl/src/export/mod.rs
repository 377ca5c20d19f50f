//! Bulk export of existing tables.
//!
//! A table is split into fixed-size pages ordered by the rule's order column. Pages are claimed
//! by a fixed number of workers, transformed through the rule and written with
//! [`crate::destination::Destination::write_batch`].

mod exporter;
mod scanner;

pub use exporter::{BulkExporter, ExportReport};
pub use scanner::{MySqlTableScanner, TableScanner, page_query};
