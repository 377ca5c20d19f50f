use std::time::Duration;

use fred::clients::Pipeline;
use fred::error::{Error, ErrorKind};
use fred::prelude::{
    Client, ClientLike, EventInterface, FredResult, HashesInterface, KeysInterface,
    ListInterface, Pool, ReconnectPolicy, Server, ServerConfig, SetsInterface,
    SortedSetsInterface, TcpConfig,
};
use fred::types::config::{ClusterDiscoveryPolicy, UnresponsiveConfig};
use fred::types::{Builder, Value};
use futures::future::join_all;
use secrecy::ExposeSecret;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error};

use crate::redis::RedisSettings;
use crate::redis::commands::RedisCommand;

/// Connections kept per client.
const POOL_SIZE: usize = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub(super) struct RedisClient {
    pool: Pool,
}

impl RedisClient {
    pub(super) async fn new(settings: &RedisSettings) -> FredResult<Self> {
        let server = server_config(settings);
        let clustered = matches!(server, ServerConfig::Clustered { .. });

        let pool = Builder::default_centralized()
            .with_config(|redis_config| {
                redis_config.username = settings.username.clone();
                redis_config.password = settings
                    .password
                    .as_ref()
                    .map(|password| password.expose_secret().to_string());
                redis_config.database = (!clustered).then_some(settings.database);
                redis_config.server = server.clone();
            })
            .with_connection_config(|config| {
                config.internal_command_timeout = Duration::from_secs(5);
                config.reconnect_on_auth_error = true;
                config.tcp = TcpConfig {
                    #[cfg(target_os = "linux")]
                    user_timeout: Some(Duration::from_secs(5)),
                    ..Default::default()
                };
                config.unresponsive = UnresponsiveConfig {
                    max_timeout: Some(Duration::from_secs(10)),
                    interval: Duration::from_secs(3),
                };
            })
            .with_performance_config(|config| {
                config.default_command_timeout = Duration::from_secs(5);
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 1, 2000, 5))
            .build_pool(POOL_SIZE)?;

        for client in pool.clients() {
            spawn_event_listeners(client);
        }
        let client_handles = pool.connect_pool();

        debug!("waiting for redis connections");
        match tokio::time::timeout(CONNECT_TIMEOUT, pool.wait_for_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = pool.quit().await;
                return Err(Error::new(
                    ErrorKind::Timeout,
                    "timed out waiting for redis connections",
                ));
            }
        }
        debug!("redis connections established");

        tokio::spawn(async move {
            let _results = join_all(client_handles).await;
        });

        Ok(Self { pool })
    }

    pub(super) async fn ping(&self) -> FredResult<()> {
        self.pool.next_connected().ping::<()>(None).await
    }

    /// Sends every command in one pipeline. The first failing command fails the call.
    pub(super) async fn apply(&self, commands: &[RedisCommand]) -> FredResult<()> {
        let pipeline = self.pool.next_connected().pipeline();
        for command in commands {
            queue(&pipeline, command).await?;
        }

        let _: Vec<Value> = pipeline.all().await?;

        Ok(())
    }

    pub(super) async fn quit(&self) -> FredResult<()> {
        self.pool.quit().await
    }
}

fn server_config(settings: &RedisSettings) -> ServerConfig {
    let mut hosts: Vec<Server> = settings
        .addresses
        .iter()
        .map(|(host, port)| Server::new(host.as_str(), *port))
        .collect();

    if let Some(service_name) = &settings.sentinel_master {
        return ServerConfig::Sentinel {
            hosts,
            service_name: service_name.clone(),
        };
    }

    if hosts.len() == 1
        && let Some(server) = hosts.pop()
    {
        return ServerConfig::Centralized { server };
    }

    ServerConfig::Clustered {
        hosts,
        policy: ClusterDiscoveryPolicy::default(),
    }
}

async fn queue(pipeline: &Pipeline<Client>, command: &RedisCommand) -> FredResult<()> {
    match command {
        RedisCommand::Set { key, value } => {
            pipeline
                .set::<(), _, _>(key.as_str(), value.as_str(), None, None, false)
                .await
        }
        RedisCommand::Del { key } => pipeline.del::<(), _>(key.as_str()).await,
        RedisCommand::HSet { key, field, value } => {
            pipeline
                .hset::<(), _, _>(key.as_str(), (field.as_str(), value.as_str()))
                .await
        }
        RedisCommand::HDel { key, field } => {
            pipeline.hdel::<(), _, _>(key.as_str(), field.as_str()).await
        }
        RedisCommand::RPush { key, value } => {
            pipeline.rpush::<(), _, _>(key.as_str(), value.as_str()).await
        }
        RedisCommand::LRem { key, value } => {
            pipeline.lrem::<(), _, _>(key.as_str(), 0, value.as_str()).await
        }
        RedisCommand::SAdd { key, member } => {
            pipeline.sadd::<(), _, _>(key.as_str(), member.as_str()).await
        }
        RedisCommand::SRem { key, member } => {
            pipeline.srem::<(), _, _>(key.as_str(), member.as_str()).await
        }
        RedisCommand::ZAdd { key, score, member } => {
            pipeline
                .zadd::<(), _, _>(
                    key.as_str(),
                    None,
                    None,
                    false,
                    false,
                    (*score, member.as_str()),
                )
                .await
        }
        RedisCommand::ZRem { key, member } => {
            pipeline.zrem::<(), _, _>(key.as_str(), member.as_str()).await
        }
        RedisCommand::Expire { key, seconds } => {
            pipeline.expire::<(), _>(key.as_str(), *seconds, None).await
        }
    }
}

// Spawns tasks that log connection errors, unresponsive servers and reconnects.
fn spawn_event_listeners(client: &Client) {
    let mut error_rx = client.error_rx();
    let mut reconnect_rx = client.reconnect_rx();
    let mut unresponsive_rx = client.unresponsive_rx();

    tokio::spawn(async move {
        loop {
            match error_rx.recv().await {
                Ok((error, Some(server))) => {
                    error!("redis client ({server:?}) error: {error:?}");
                }
                Ok((error, None)) => {
                    error!("redis client error: {error:?}");
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match unresponsive_rx.recv().await {
                Ok(server) => {
                    error!("redis client ({server:?}) unresponsive");
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match reconnect_rx.recv().await {
                Ok(server) => {
                    debug!("redis client connected to {server:?}")
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}
