//! Destination abstractions.
//!
//! A [`Destination`] turns batches of [`crate::types::RowEventRequest`]s into native writes of
//! one target system. Concrete network adapters live in the `etl-destinations` crate; this
//! module only ships the in-memory destination used by tests and dry runs.

mod base;
pub mod memory;

pub use base::Destination;
