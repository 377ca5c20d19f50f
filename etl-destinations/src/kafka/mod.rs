use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use config::shared::{EndpointConfig, KafkaCompression};
use etl::destination::Destination;
use etl::error::{ErrorKind, EtlError, EtlResult};
use etl::etl_error;
use etl::rule::RuleContext;
use etl::script::ScriptSession;
use etl::types::RowEventRequest;
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::egress::{PROCESSING_TYPE_EXPORT, PROCESSING_TYPE_STREAM, log_processed_bytes};
use crate::encoding::{Message, messages};

/// Settings of a Kafka endpoint.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub compression: KafkaCompression,
    pub partition: i32,
}

impl KafkaSettings {
    pub fn from_endpoint(endpoint: &EndpointConfig) -> EtlResult<Self> {
        let EndpointConfig::Kafka {
            addresses,
            compression,
            partition,
        } = endpoint
        else {
            return Err(etl_error!(
                ErrorKind::ConfigError,
                "Endpoint is not a Kafka endpoint",
                format!("Got a {} endpoint", endpoint.kind())
            ));
        };

        Ok(Self {
            brokers: addresses.clone(),
            compression: *compression,
            partition: *partition,
        })
    }
}

fn compression(codec: KafkaCompression) -> Compression {
    match codec {
        KafkaCompression::None => Compression::NoCompression,
        KafkaCompression::Gzip => Compression::Gzip,
        KafkaCompression::Lz4 => Compression::Lz4,
        KafkaCompression::Snappy => Compression::Snappy,
        KafkaCompression::Zstd => Compression::Zstd,
    }
}

/// Groups messages by topic, keeping the order within each topic.
pub fn records_by_topic(messages: Vec<Message>) -> BTreeMap<String, Vec<Record>> {
    let timestamp = Utc::now();
    let mut records: BTreeMap<String, Vec<Record>> = BTreeMap::new();

    for message in messages {
        records.entry(message.topic).or_default().push(Record {
            key: message.key.map(String::into_bytes),
            value: Some(message.payload.into_bytes()),
            headers: BTreeMap::new(),
            timestamp,
        });
    }

    records
}

/// Produces one record per row to the rule's topic.
///
/// All records go to the configured partition, so a topic keeps the binlog order.
#[derive(Clone)]
pub struct KafkaDestination {
    settings: Arc<KafkaSettings>,
    client: Arc<RwLock<Option<Arc<Client>>>>,
    partitions: Arc<Mutex<HashMap<String, Arc<PartitionClient>>>>,
}

impl KafkaDestination {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            client: Arc::new(RwLock::new(None)),
            partitions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn client(&self) -> EtlResult<Arc<Client>> {
        match self.client.read().await.as_ref() {
            Some(client) => Ok(client.clone()),
            None => Err(etl_error!(
                ErrorKind::DestinationUnhealthy,
                "Kafka client is not connected"
            )),
        }
    }

    async fn partition_client(&self, topic: &str) -> EtlResult<Arc<PartitionClient>> {
        let mut partitions = self.partitions.lock().await;
        if let Some(partition_client) = partitions.get(topic) {
            return Ok(partition_client.clone());
        }

        let partition_client = self
            .client()
            .await?
            .partition_client(topic, self.settings.partition, UnknownTopicHandling::Retry)
            .await
            .map_err(|err| {
                EtlError::from((
                    ErrorKind::DestinationConnectionFailed,
                    "Cannot open a Kafka partition client",
                    format!("{topic}: {err}"),
                ))
            })?;
        let partition_client = Arc::new(partition_client);
        partitions.insert(topic.to_string(), partition_client.clone());

        Ok(partition_client)
    }

    async fn produce(
        &self,
        messages: Vec<Message>,
        processing_type: &'static str,
    ) -> EtlResult<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let count = messages.len();
        let bytes: usize = messages
            .iter()
            .map(|message| message.payload.len() + message.key.as_ref().map_or(0, String::len))
            .sum();
        let started = Instant::now();

        for (topic, records) in records_by_topic(messages) {
            let partition_client = self.partition_client(&topic).await?;
            partition_client
                .produce(records, compression(self.settings.compression))
                .await
                .map_err(|err| {
                    EtlError::from((
                        ErrorKind::DestinationQueryFailed,
                        "Kafka produce failed",
                        format!("{topic}: {err}"),
                    ))
                })?;
        }

        log_processed_bytes(
            Self::name(),
            processing_type,
            count,
            bytes as u64,
            started.elapsed(),
        );

        Ok(())
    }
}

impl Destination for KafkaDestination {
    fn name() -> &'static str {
        "kafka"
    }

    async fn connect(&self) -> EtlResult<()> {
        let client = ClientBuilder::new(self.settings.brokers.clone())
            .build()
            .await
            .map_err(|err| {
                EtlError::from((
                    ErrorKind::DestinationConnectionFailed,
                    "Cannot connect to Kafka",
                    err.to_string(),
                ))
            })?;

        *self.client.write().await = Some(Arc::new(client));
        self.partitions.lock().await.clear();
        info!(brokers = ?self.settings.brokers, "connected to kafka");

        Ok(())
    }

    async fn ping(&self) -> EtlResult<()> {
        self.client().await?.list_topics().await.map_err(|err| {
            EtlError::from((
                ErrorKind::DestinationUnhealthy,
                "Kafka metadata request failed",
                err.to_string(),
            ))
        })?;

        Ok(())
    }

    async fn close(&self) -> EtlResult<()> {
        self.partitions.lock().await.clear();
        self.client.write().await.take();

        Ok(())
    }

    async fn write_rows(&self, requests: Vec<RowEventRequest>) -> EtlResult<()> {
        let mut outgoing = Vec::with_capacity(requests.len());
        for request in &requests {
            outgoing.extend(messages(&request.context, request, None)?);
        }

        debug!(rows = requests.len(), "producing rows to kafka");
        self.produce(outgoing, PROCESSING_TYPE_STREAM).await
    }

    async fn write_batch(
        &self,
        context: &RuleContext,
        requests: Vec<RowEventRequest>,
        mut session: Option<&mut ScriptSession>,
    ) -> EtlResult<usize> {
        let mut outgoing = Vec::with_capacity(requests.len());
        for request in &requests {
            outgoing.extend(messages(context, request, session.as_deref_mut())?);
        }

        self.produce(outgoing, PROCESSING_TYPE_EXPORT).await?;

        Ok(requests.len())
    }
}
