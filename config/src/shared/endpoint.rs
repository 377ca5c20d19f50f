use std::collections::BTreeMap;

use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::{ValidationError, parse_address};

/// Destination a pipeline writes to.
///
/// The `type` tag selects the adapter once at construction. Address lists with more than one
/// entry select the cluster client where the destination supports one.
///
/// This intentionally does not implement [`serde::Serialize`] to avoid leaking credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EndpointConfig {
    Redis {
        /// `host:port` entries. More than one selects cluster mode unless a sentinel
        /// master name is configured.
        addresses: Vec<String>,
        username: Option<String>,
        password: Option<SecretString>,
        /// Master name when the addresses point at sentinels.
        sentinel_master: Option<String>,
        /// Logical database, ignored in cluster mode.
        #[serde(default)]
        database: u8,
    },
    Elasticsearch {
        /// Base URLs, e.g. `http://127.0.0.1:9200`. Requests go to the first reachable one.
        addresses: Vec<String>,
        username: Option<String>,
        password: Option<SecretString>,
        #[serde(default = "default_request_timeout_ms")]
        timeout_ms: u64,
    },
    Kafka {
        addresses: Vec<String>,
        #[serde(default)]
        compression: KafkaCompression,
        /// Partition every message is produced to.
        #[serde(default)]
        partition: i32,
    },
    Mqtt {
        /// A single `host:port` broker address.
        addresses: Vec<String>,
        client_id: Option<String>,
        username: Option<String>,
        password: Option<SecretString>,
        #[serde(default)]
        qos: MqttQos,
        #[serde(default = "default_keep_alive_secs")]
        keep_alive_secs: u64,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        bearer_token: Option<SecretString>,
        #[serde(default = "default_request_timeout_ms")]
        timeout_ms: u64,
    },
}

impl EndpointConfig {
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

    pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

    /// Short name of the destination family.
    pub fn kind(&self) -> &'static str {
        match self {
            EndpointConfig::Redis { .. } => "redis",
            EndpointConfig::Elasticsearch { .. } => "elasticsearch",
            EndpointConfig::Kafka { .. } => "kafka",
            EndpointConfig::Mqtt { .. } => "mqtt",
            EndpointConfig::Http { .. } => "http",
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            EndpointConfig::Redis { addresses, .. }
            | EndpointConfig::Kafka { addresses, .. }
            | EndpointConfig::Mqtt { addresses, .. } => {
                if addresses.is_empty() {
                    return Err(ValidationError::MissingAddress(self.kind()));
                }
                for address in addresses {
                    parse_address(address)?;
                }
            }
            EndpointConfig::Elasticsearch { addresses, .. } => {
                if addresses.is_empty() {
                    return Err(ValidationError::MissingAddress(self.kind()));
                }
                for address in addresses {
                    if !address.starts_with("http://") && !address.starts_with("https://") {
                        return Err(ValidationError::InvalidAddress(address.clone()));
                    }
                }
            }
            EndpointConfig::Http { url, .. } => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ValidationError::InvalidAddress(url.clone()));
                }
            }
        }

        Ok(())
    }
}

fn default_request_timeout_ms() -> u64 {
    EndpointConfig::DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_keep_alive_secs() -> u64 {
    EndpointConfig::DEFAULT_KEEP_ALIVE_SECS
}

/// Compression codec for produced Kafka record batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KafkaCompression {
    #[default]
    None,
    Gzip,
    Lz4,
    Snappy,
    Zstd,
}

/// MQTT delivery guarantee for published messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MqttQos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_endpoint_requires_well_formed_addresses() {
        let endpoint = EndpointConfig::Redis {
            addresses: vec!["127.0.0.1:6379".to_string(), "bad".to_string()],
            username: None,
            password: None,
            sentinel_master: None,
            database: 0,
        };

        assert_eq!(
            endpoint.validate(),
            Err(ValidationError::InvalidAddress("bad".to_string()))
        );
    }

    #[test]
    fn http_endpoint_requires_scheme() {
        let endpoint = EndpointConfig::Http {
            url: "example.com/hook".to_string(),
            headers: BTreeMap::new(),
            bearer_token: None,
            timeout_ms: 1_000,
        };

        assert!(endpoint.validate().is_err());
    }
}
