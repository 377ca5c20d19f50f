//! Configuration types and loading for the binlog replication workspace.
//!
//! Every service loads a [`shared::ReplicatorConfig`] (or a subset of it) through
//! [`load::load_config`], which layers the base file, the environment file and `APP_`
//! environment variables.

pub mod environment;
pub mod load;
pub mod shared;

pub use load::{Config, LoadConfigError, load_config};
