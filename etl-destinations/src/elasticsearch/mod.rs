mod bulk;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use config::shared::EndpointConfig;
use etl::destination::Destination;
use etl::error::{ErrorKind, EtlError, EtlResult};
use etl::etl_error;
use etl::rule::RuleContext;
use etl::script::ScriptSession;
use etl::types::RowEventRequest;
use reqwest::{Client, Method, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::egress::{PROCESSING_TYPE_EXPORT, PROCESSING_TYPE_STREAM, log_processed_bytes};
use crate::encoding::{Document, documents};

pub use bulk::{bulk_body, check_bulk_response, index_name};

/// Connection settings of an Elasticsearch endpoint.
#[derive(Debug, Clone)]
pub struct ElasticsearchSettings {
    /// Base URLs without a trailing slash.
    pub addresses: Vec<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub timeout: Duration,
}

impl ElasticsearchSettings {
    pub fn from_endpoint(endpoint: &EndpointConfig) -> EtlResult<Self> {
        let EndpointConfig::Elasticsearch {
            addresses,
            username,
            password,
            timeout_ms,
        } = endpoint
        else {
            return Err(etl_error!(
                ErrorKind::ConfigError,
                "Endpoint is not an Elasticsearch endpoint",
                format!("Got a {} endpoint", endpoint.kind())
            ));
        };

        Ok(Self {
            addresses: addresses
                .iter()
                .map(|address| address.trim_end_matches('/').to_string())
                .collect(),
            username: username.clone(),
            password: password.clone(),
            timeout: Duration::from_millis(*timeout_ms),
        })
    }
}

/// Indexes rows as documents through the `_bulk` API.
///
/// Requests go to the last address that answered. A transport failure moves on to the next
/// address before the write is reported as failed.
#[derive(Debug, Clone)]
pub struct ElasticsearchDestination {
    settings: Arc<ElasticsearchSettings>,
    client: Client,
    active: Arc<AtomicUsize>,
}

impl ElasticsearchDestination {
    pub fn new(settings: ElasticsearchSettings) -> EtlResult<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| {
                EtlError::from((
                    ErrorKind::ConfigError,
                    "Cannot build the Elasticsearch client",
                    err.to_string(),
                ))
            })?;

        Ok(Self {
            settings: Arc::new(settings),
            client,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn request(&self, method: Method, base: &str, path: &str) -> RequestBuilder {
        let request = self.client.request(method, format!("{base}{path}"));
        match &self.settings.username {
            Some(username) => request.basic_auth(
                username,
                self.settings
                    .password
                    .as_ref()
                    .map(|password| password.expose_secret().to_string()),
            ),
            None => request,
        }
    }

    /// Sends a request, failing over to the next address on transport errors.
    async fn send(&self, method: Method, path: &str, body: Option<&str>) -> EtlResult<Response> {
        let addresses = &self.settings.addresses;
        let first = self.active.load(Ordering::Relaxed);
        let mut last_error = None;

        for attempt in 0..addresses.len() {
            let index = (first + attempt) % addresses.len();
            let mut request = self.request(method.clone(), &addresses[index], path);
            if let Some(body) = body {
                request = request
                    .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                    .body(body.to_string());
            }

            match request.send().await {
                Ok(response) => {
                    self.active.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(err) => {
                    warn!(
                        address = %addresses[index],
                        error = %err,
                        "elasticsearch request failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(etl_error!(
            ErrorKind::DestinationConnectionFailed,
            "No Elasticsearch address is reachable",
            last_error.map(|err| err.to_string()).unwrap_or_default()
        ))
    }

    async fn write_documents(
        &self,
        items: Vec<(String, Document)>,
        processing_type: &'static str,
    ) -> EtlResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let body = bulk_body(items.iter().map(|(index, document)| (index.as_str(), document)))?;
        let started = Instant::now();
        let response = self.send(Method::POST, "/_bulk", Some(&body)).await?;

        let status = response.status();
        let text = response.text().await.map_err(|err| {
            EtlError::from((
                ErrorKind::DestinationQueryFailed,
                "Cannot read the Elasticsearch response",
                err.to_string(),
            ))
        })?;
        if !status.is_success() {
            return Err(etl_error!(
                ErrorKind::DestinationQueryFailed,
                "Elasticsearch bulk request failed",
                format!("{status}: {text}")
            ));
        }
        check_bulk_response(&text)?;

        log_processed_bytes(
            Self::name(),
            processing_type,
            items.len(),
            body.len() as u64,
            started.elapsed(),
        );

        Ok(())
    }
}

impl Destination for ElasticsearchDestination {
    fn name() -> &'static str {
        "elasticsearch"
    }

    async fn connect(&self) -> EtlResult<()> {
        self.ping().await?;
        info!(
            address = ?self.settings.addresses.get(self.active.load(Ordering::Relaxed)),
            "connected to elasticsearch"
        );

        Ok(())
    }

    async fn ping(&self) -> EtlResult<()> {
        let response = self.send(Method::GET, "/", None).await?;
        if !response.status().is_success() {
            return Err(etl_error!(
                ErrorKind::DestinationUnhealthy,
                "Elasticsearch health check failed",
                response.status()
            ));
        }

        Ok(())
    }

    async fn write_rows(&self, requests: Vec<RowEventRequest>) -> EtlResult<()> {
        let mut items = Vec::with_capacity(requests.len());
        for request in &requests {
            let index = index_name(&request.context);
            for document in documents(&request.context, request, None)? {
                items.push((index.clone(), document));
            }
        }

        debug!(rows = requests.len(), items = items.len(), "writing rows to elasticsearch");
        self.write_documents(items, PROCESSING_TYPE_STREAM).await
    }

    async fn write_batch(
        &self,
        context: &RuleContext,
        requests: Vec<RowEventRequest>,
        mut session: Option<&mut ScriptSession>,
    ) -> EtlResult<usize> {
        let index = index_name(context);
        let mut items = Vec::with_capacity(requests.len());
        for request in &requests {
            for document in documents(context, request, session.as_deref_mut())? {
                items.push((index.clone(), document));
            }
        }

        self.write_documents(items, PROCESSING_TYPE_EXPORT).await?;

        Ok(requests.len())
    }
}
