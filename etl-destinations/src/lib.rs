//! Destination adapters for the binlog pipeline.
//!
//! Every adapter implements [`etl::destination::Destination`]. The replicator picks one through
//! [`build_destination`], which turns the configured endpoint into an [`AnyDestination`].

mod any;
pub mod egress;
pub mod encoding;
#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod metrics;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "redis")]
pub mod redis;

pub use any::{AnyDestination, build_destination};
