use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use config::shared::{EndpointConfig, MqttQos, parse_address};
use etl::destination::Destination;
use etl::error::{ErrorKind, EtlError, EtlResult};
use etl::etl_error;
use etl::rule::RuleContext;
use etl::script::ScriptSession;
use etl::types::RowEventRequest;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::egress::{PROCESSING_TYPE_EXPORT, PROCESSING_TYPE_STREAM, log_processed_bytes};
use crate::encoding::{Message, messages};

/// Capacity of the request queue between the client and its event loop.
const REQUEST_CAPACITY: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings of an MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub qos: MqttQos,
    pub keep_alive: Duration,
}

impl MqttSettings {
    pub fn from_endpoint(endpoint: &EndpointConfig) -> EtlResult<Self> {
        let EndpointConfig::Mqtt {
            addresses,
            client_id,
            username,
            password,
            qos,
            keep_alive_secs,
        } = endpoint
        else {
            return Err(etl_error!(
                ErrorKind::ConfigError,
                "Endpoint is not an MQTT endpoint",
                format!("Got a {} endpoint", endpoint.kind())
            ));
        };

        let Some(address) = addresses.first() else {
            return Err(etl_error!(
                ErrorKind::ConfigError,
                "MQTT endpoint has no broker address"
            ));
        };
        let (host, port) = parse_address(address)
            .map_err(|err| etl_error!(ErrorKind::ConfigError, "Invalid MQTT address", err))?;

        Ok(Self {
            host,
            port,
            client_id: client_id
                .clone()
                .unwrap_or_else(|| format!("mysql-binlog-{}", std::process::id())),
            username: username.clone(),
            password: password.clone(),
            qos: *qos,
            keep_alive: Duration::from_secs(*keep_alive_secs),
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        if let Some(username) = &self.username {
            let password = self
                .password
                .as_ref()
                .map(|password| password.expose_secret().to_string())
                .unwrap_or_default();
            options.set_credentials(username.clone(), password);
        }

        options
    }
}

fn qos(qos: MqttQos) -> QoS {
    match qos {
        MqttQos::AtMostOnce => QoS::AtMostOnce,
        MqttQos::AtLeastOnce => QoS::AtLeastOnce,
        MqttQos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// A live session: the client handle and the task driving its event loop.
struct Session {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

/// Publishes one message per row to the rule's topic.
///
/// Publishing hands messages to the event loop; the broker acknowledges them asynchronously.
/// A broken connection flips the destination to unhealthy so the next write fails.
#[derive(Clone)]
pub struct MqttDestination {
    settings: Arc<MqttSettings>,
    session: Arc<Mutex<Option<Session>>>,
    connected: Arc<AtomicBool>,
}

impl MqttDestination {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            session: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn client(&self) -> EtlResult<AsyncClient> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(etl_error!(
                ErrorKind::DestinationUnhealthy,
                "MQTT broker connection is down"
            ));
        }

        match self.session.lock().await.as_ref() {
            Some(session) => Ok(session.client.clone()),
            None => Err(etl_error!(
                ErrorKind::DestinationUnhealthy,
                "MQTT client is not connected"
            )),
        }
    }

    async fn publish(
        &self,
        messages: Vec<Message>,
        processing_type: &'static str,
    ) -> EtlResult<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let client = self.client().await?;
        let count = messages.len();
        let mut bytes = 0;
        let started = Instant::now();

        for message in messages {
            bytes += message.payload.len();
            client
                .publish(
                    message.topic,
                    qos(self.settings.qos),
                    false,
                    message.payload.into_bytes(),
                )
                .await
                .map_err(|err| {
                    EtlError::from((
                        ErrorKind::DestinationQueryFailed,
                        "MQTT publish failed",
                        err.to_string(),
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

/// Polls until the broker accepted the connection.
async fn await_connack(event_loop: &mut EventLoop) -> EtlResult<()> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                if connack.code == ConnectReturnCode::Success {
                    return Ok(());
                }

                return Err(etl_error!(
                    ErrorKind::DestinationConnectionFailed,
                    "MQTT broker refused the connection",
                    format!("{:?}", connack.code)
                ));
            }
            Ok(_) => continue,
            Err(err) => {
                return Err(etl_error!(
                    ErrorKind::DestinationConnectionFailed,
                    "Cannot connect to the MQTT broker",
                    err
                ));
            }
        }
    }
}

/// Drives the event loop. rumqttc reconnects on the next poll after an error.
async fn drive_event_loop(mut event_loop: EventLoop, connected: Arc<AtomicBool>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::Release);
                debug!("mqtt connection re-established");
            }
            Ok(_) => {}
            Err(err) => {
                if connected.swap(false, Ordering::AcqRel) {
                    warn!(error = %err, "mqtt connection lost");
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

impl Destination for MqttDestination {
    fn name() -> &'static str {
        "mqtt"
    }

    async fn connect(&self) -> EtlResult<()> {
        self.close().await?;

        let (client, mut event_loop) = AsyncClient::new(self.settings.options(), REQUEST_CAPACITY);
        match tokio::time::timeout(CONNECT_TIMEOUT, await_connack(&mut event_loop)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(etl_error!(
                    ErrorKind::DestinationConnectionFailed,
                    "Timed out connecting to the MQTT broker",
                    format!("{}:{}", self.settings.host, self.settings.port)
                ));
            }
        }

        self.connected.store(true, Ordering::Release);
        let span = info_span!("mqtt_event_loop", broker = %self.settings.host);
        let event_loop = tokio::spawn(
            drive_event_loop(event_loop, self.connected.clone()).instrument(span),
        );
        *self.session.lock().await = Some(Session { client, event_loop });
        info!(host = %self.settings.host, port = self.settings.port, "connected to mqtt broker");

        Ok(())
    }

    async fn ping(&self) -> EtlResult<()> {
        self.client().await.map(|_| ())
    }

    async fn close(&self) -> EtlResult<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        self.connected.store(false, Ordering::Release);
        if let Err(err) = session.client.disconnect().await {
            debug!(error = %err, "mqtt disconnect failed");
        }
        session.event_loop.abort();

        Ok(())
    }

    async fn write_rows(&self, requests: Vec<RowEventRequest>) -> EtlResult<()> {
        let mut outgoing = Vec::with_capacity(requests.len());
        for request in &requests {
            outgoing.extend(messages(&request.context, request, None)?);
        }

        debug!(rows = requests.len(), "publishing rows to mqtt");
        self.publish(outgoing, PROCESSING_TYPE_STREAM).await
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

        self.publish(outgoing, PROCESSING_TYPE_EXPORT).await?;

        Ok(requests.len())
    }
}
