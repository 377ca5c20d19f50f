//! Test doubles for the pipeline's external collaborators.
//!
//! - [`source`] scripts a binlog subscription without a MySQL server.
//! - [`destination`] wraps a destination so tests can make it fail and recover.
//! - [`scanner`] serves export pages from memory.
//! - [`pipeline`] builds pipelines wired to the doubles above.
//! - [`schema`] holds the table fixtures shared by unit and integration tests.
//! - [`notify`] waits on notifications with a timeout so a broken test fails instead of hanging.

pub mod destination;
pub mod notify;
pub mod pipeline;
pub mod scanner;
pub mod schema;
pub mod source;
