//! Shared configuration types for replication pipelines.

mod base;
mod batch;
mod connection;
mod endpoint;
mod pipeline;
mod replicator;
mod rule;
mod store;

pub use base::{ValidationError, parse_address};
pub use batch::BatchConfig;
pub use connection::{IntoConnectOptions, MySqlConnectionConfig};
pub use endpoint::{EndpointConfig, KafkaCompression, MqttQos};
pub use pipeline::{ExportConfig, PipelineConfig};
pub use replicator::ReplicatorConfig;
pub use rule::{ColumnCase, RedisRuleConfig, RedisStructure, RuleConfig, ValueEncoding};
pub use store::CheckpointStoreConfig;
