mod client;
mod commands;

use std::sync::Arc;
use std::time::Instant;

use config::shared::{EndpointConfig, parse_address};
use etl::destination::Destination;
use etl::error::{ErrorKind, EtlError, EtlResult};
use etl::etl_error;
use etl::rule::RuleContext;
use etl::script::ScriptSession;
use etl::types::RowEventRequest;
use secrecy::SecretString;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::egress::{PROCESSING_TYPE_EXPORT, PROCESSING_TYPE_STREAM, log_processed_bytes};
use crate::redis::client::RedisClient;

pub use commands::{RedisCommand, build_commands};

/// Connection settings of a Redis endpoint.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub addresses: Vec<(String, u16)>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Master name when `addresses` point at sentinels.
    pub sentinel_master: Option<String>,
    pub database: u8,
}

impl RedisSettings {
    pub fn from_endpoint(endpoint: &EndpointConfig) -> EtlResult<Self> {
        let EndpointConfig::Redis {
            addresses,
            username,
            password,
            sentinel_master,
            database,
        } = endpoint
        else {
            return Err(etl_error!(
                ErrorKind::ConfigError,
                "Endpoint is not a Redis endpoint",
                format!("Got a {} endpoint", endpoint.kind())
            ));
        };

        let addresses = addresses
            .iter()
            .map(|address| {
                parse_address(address).map_err(|err| {
                    etl_error!(ErrorKind::ConfigError, "Invalid Redis address", err)
                })
            })
            .collect::<EtlResult<Vec<_>>>()?;

        Ok(Self {
            addresses,
            username: username.clone(),
            password: password.clone(),
            sentinel_master: sentinel_master.clone(),
            database: *database,
        })
    }
}

/// Writes rows to Redis strings, hashes, lists, sets and sorted sets.
///
/// All commands of one batch go out in a single pipeline. One address selects a centralized
/// client, several select the cluster client, and a sentinel master name selects sentinel
/// discovery.
#[derive(Clone)]
pub struct RedisDestination {
    settings: Arc<RedisSettings>,
    client: Arc<RwLock<Option<RedisClient>>>,
}

impl RedisDestination {
    pub fn new(settings: RedisSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            client: Arc::new(RwLock::new(None)),
        }
    }

    async fn client(&self) -> EtlResult<RedisClient> {
        match self.client.read().await.as_ref() {
            Some(client) => Ok(client.clone()),
            None => Err(etl_error!(
                ErrorKind::DestinationUnhealthy,
                "Redis client is not connected"
            )),
        }
    }

    async fn apply(
        &self,
        commands: Vec<RedisCommand>,
        processing_type: &'static str,
    ) -> EtlResult<()> {
        if commands.is_empty() {
            return Ok(());
        }

        let client = self.client().await?;
        let started = Instant::now();
        client.apply(&commands).await.map_err(|err| {
            EtlError::from((
                ErrorKind::DestinationQueryFailed,
                "Redis pipeline failed",
                err.to_string(),
            ))
        })?;

        let bytes: usize = commands.iter().map(RedisCommand::payload_len).sum();
        log_processed_bytes(
            Self::name(),
            processing_type,
            commands.len(),
            bytes as u64,
            started.elapsed(),
        );

        Ok(())
    }
}

impl Destination for RedisDestination {
    fn name() -> &'static str {
        "redis"
    }

    async fn connect(&self) -> EtlResult<()> {
        let client = RedisClient::new(&self.settings).await.map_err(|err| {
            EtlError::from((
                ErrorKind::DestinationConnectionFailed,
                "Cannot connect to Redis",
                err.to_string(),
            ))
        })?;

        let previous = self.client.write().await.replace(client);
        if let Some(previous) = previous
            && let Err(err) = previous.quit().await
        {
            warn!(error = %err, "failed to close the previous redis client");
        }

        info!(addresses = self.settings.addresses.len(), "connected to redis");

        Ok(())
    }

    async fn ping(&self) -> EtlResult<()> {
        self.client().await?.ping().await.map_err(|err| {
            EtlError::from((
                ErrorKind::DestinationUnhealthy,
                "Redis ping failed",
                err.to_string(),
            ))
        })
    }

    async fn close(&self) -> EtlResult<()> {
        let Some(client) = self.client.write().await.take() else {
            return Ok(());
        };

        client.quit().await.map_err(|err| {
            EtlError::from((
                ErrorKind::DestinationError,
                "Failed to close the Redis client",
                err.to_string(),
            ))
        })
    }

    async fn write_rows(&self, requests: Vec<RowEventRequest>) -> EtlResult<()> {
        let mut commands = Vec::with_capacity(requests.len());
        for request in &requests {
            commands.extend(build_commands(&request.context, request, None)?);
        }

        debug!(rows = requests.len(), commands = commands.len(), "writing rows to redis");
        self.apply(commands, PROCESSING_TYPE_STREAM).await
    }

    async fn write_batch(
        &self,
        context: &RuleContext,
        requests: Vec<RowEventRequest>,
        mut session: Option<&mut ScriptSession>,
    ) -> EtlResult<usize> {
        let mut commands = Vec::with_capacity(requests.len());
        for request in &requests {
            commands.extend(build_commands(context, request, session.as_deref_mut())?);
        }

        self.apply(commands, PROCESSING_TYPE_EXPORT).await?;

        Ok(requests.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn settings_parse_every_address() {
        let endpoint = EndpointConfig::Redis {
            addresses: vec!["10.0.0.1:7000".to_string(), "[::1]:7001".to_string()],
            username: Some("app".to_string()),
            password: None,
            sentinel_master: None,
            database: 2,
        };

        let settings = RedisSettings::from_endpoint(&endpoint).unwrap();

        assert_eq!(
            settings.addresses,
            vec![("10.0.0.1".to_string(), 7000), ("::1".to_string(), 7001)]
        );
        assert_eq!(settings.database, 2);
    }

    #[test]
    fn other_endpoints_are_rejected() {
        let endpoint = EndpointConfig::Http {
            url: "http://localhost/hook".to_string(),
            headers: BTreeMap::new(),
            bearer_token: None,
            timeout_ms: 1_000,
        };

        let err = RedisSettings::from_endpoint(&endpoint).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn writes_before_connect_report_an_unhealthy_destination() {
        let destination = RedisDestination::new(RedisSettings {
            addresses: vec![("127.0.0.1".to_string(), 6379)],
            username: None,
            password: None,
            sentinel_master: None,
            database: 0,
        });

        let err = destination.ping().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DestinationUnhealthy);

        destination.close().await.unwrap();
    }
}
