use config::shared::EndpointConfig;
use etl::destination::Destination;
use etl::error::{ErrorKind, EtlResult};
use etl::etl_error;
use etl::rule::RuleContext;
use etl::script::ScriptSession;
use etl::types::RowEventRequest;

#[cfg(feature = "elasticsearch")]
use crate::elasticsearch::{ElasticsearchDestination, ElasticsearchSettings};
#[cfg(feature = "http")]
use crate::http::{HttpDestination, HttpSettings};
#[cfg(feature = "kafka")]
use crate::kafka::{KafkaDestination, KafkaSettings};
#[cfg(feature = "mqtt")]
use crate::mqtt::{MqttDestination, MqttSettings};
#[cfg(feature = "redis")]
use crate::redis::{RedisDestination, RedisSettings};

/// One of the supported destinations, chosen from the endpoint configuration at startup.
#[derive(Clone)]
pub enum AnyDestination {
    #[cfg(feature = "redis")]
    Redis(RedisDestination),
    #[cfg(feature = "elasticsearch")]
    Elasticsearch(ElasticsearchDestination),
    #[cfg(feature = "kafka")]
    Kafka(KafkaDestination),
    #[cfg(feature = "mqtt")]
    Mqtt(MqttDestination),
    #[cfg(feature = "http")]
    Http(HttpDestination),
}

/// Builds the destination an endpoint describes. No connection is opened yet.
pub fn build_destination(endpoint: &EndpointConfig) -> EtlResult<AnyDestination> {
    match endpoint {
        #[cfg(feature = "redis")]
        EndpointConfig::Redis { .. } => Ok(AnyDestination::Redis(RedisDestination::new(
            RedisSettings::from_endpoint(endpoint)?,
        ))),
        #[cfg(feature = "elasticsearch")]
        EndpointConfig::Elasticsearch { .. } => Ok(AnyDestination::Elasticsearch(
            ElasticsearchDestination::new(ElasticsearchSettings::from_endpoint(endpoint)?)?,
        )),
        #[cfg(feature = "kafka")]
        EndpointConfig::Kafka { .. } => Ok(AnyDestination::Kafka(KafkaDestination::new(
            KafkaSettings::from_endpoint(endpoint)?,
        ))),
        #[cfg(feature = "mqtt")]
        EndpointConfig::Mqtt { .. } => Ok(AnyDestination::Mqtt(MqttDestination::new(
            MqttSettings::from_endpoint(endpoint)?,
        ))),
        #[cfg(feature = "http")]
        EndpointConfig::Http { .. } => Ok(AnyDestination::Http(HttpDestination::new(
            HttpSettings::from_endpoint(endpoint)?,
        )?)),
        #[allow(unreachable_patterns)]
        other => Err(etl_error!(
            ErrorKind::ConfigError,
            "Destination support is not compiled in",
            other.kind()
        )),
    }
}

macro_rules! dispatch {
    ($self:expr, $destination:ident => $body:expr) => {
        match $self {
            #[cfg(feature = "redis")]
            AnyDestination::Redis($destination) => $body,
            #[cfg(feature = "elasticsearch")]
            AnyDestination::Elasticsearch($destination) => $body,
            #[cfg(feature = "kafka")]
            AnyDestination::Kafka($destination) => $body,
            #[cfg(feature = "mqtt")]
            AnyDestination::Mqtt($destination) => $body,
            #[cfg(feature = "http")]
            AnyDestination::Http($destination) => $body,
        }
    };
}

impl AnyDestination {
    /// Name of the wrapped destination.
    pub fn kind(&self) -> &'static str {
        match self {
            #[cfg(feature = "redis")]
            AnyDestination::Redis(_) => RedisDestination::name(),
            #[cfg(feature = "elasticsearch")]
            AnyDestination::Elasticsearch(_) => ElasticsearchDestination::name(),
            #[cfg(feature = "kafka")]
            AnyDestination::Kafka(_) => KafkaDestination::name(),
            #[cfg(feature = "mqtt")]
            AnyDestination::Mqtt(_) => MqttDestination::name(),
            #[cfg(feature = "http")]
            AnyDestination::Http(_) => HttpDestination::name(),
        }
    }
}

impl Destination for AnyDestination {
    fn name() -> &'static str {
        "endpoint"
    }

    async fn connect(&self) -> EtlResult<()> {
        dispatch!(self, destination => destination.connect().await)
    }

    async fn ping(&self) -> EtlResult<()> {
        dispatch!(self, destination => destination.ping().await)
    }

    async fn close(&self) -> EtlResult<()> {
        dispatch!(self, destination => destination.close().await)
    }

    async fn write_rows(&self, requests: Vec<RowEventRequest>) -> EtlResult<()> {
        dispatch!(self, destination => destination.write_rows(requests).await)
    }

    async fn write_batch(
        &self,
        context: &RuleContext,
        requests: Vec<RowEventRequest>,
        session: Option<&mut ScriptSession>,
    ) -> EtlResult<usize> {
        dispatch!(self, destination => destination.write_batch(context, requests, session).await)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn endpoints_select_their_destination() {
        let redis = EndpointConfig::Redis {
            addresses: vec!["127.0.0.1:6379".to_string()],
            username: None,
            password: None,
            sentinel_master: None,
            database: 0,
        };
        let http = EndpointConfig::Http {
            url: "http://127.0.0.1:8080/hook".to_string(),
            headers: BTreeMap::new(),
            bearer_token: None,
            timeout_ms: 1_000,
        };

        assert_eq!(build_destination(&redis).unwrap().kind(), "redis");
        assert_eq!(build_destination(&http).unwrap().kind(), "http");
    }

    #[test]
    fn invalid_http_headers_are_rejected() {
        let http = EndpointConfig::Http {
            url: "http://127.0.0.1:8080/hook".to_string(),
            headers: BTreeMap::from([("bad header".to_string(), "x".to_string())]),
            bearer_token: None,
            timeout_ms: 1_000,
        };

        let err = build_destination(&http).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }
}
