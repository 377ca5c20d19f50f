//! Persistence of replication checkpoints.
//!
//! A checkpoint is one [`mysql::types::BinlogPosition`] per pipeline. It is read once when a
//! pipeline starts and written by the flush loop after the rows it covers were delivered.

pub mod base;
pub mod memory;
pub mod sqlite;

pub use base::PositionStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
