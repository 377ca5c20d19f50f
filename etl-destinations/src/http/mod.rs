use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use config::shared::EndpointConfig;
use etl::destination::Destination;
use etl::error::{ErrorKind, EtlError, EtlResult};
use etl::etl_error;
use etl::rule::RuleContext;
use etl::script::ScriptSession;
use etl::types::RowEventRequest;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::egress::{PROCESSING_TYPE_EXPORT, PROCESSING_TYPE_STREAM, log_processed_bytes};
use crate::encoding::{Message, json_array, messages};

/// Settings of a generic HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub bearer_token: Option<SecretString>,
    pub timeout: Duration,
}

impl HttpSettings {
    pub fn from_endpoint(endpoint: &EndpointConfig) -> EtlResult<Self> {
        let EndpointConfig::Http {
            url,
            headers,
            bearer_token,
            timeout_ms,
        } = endpoint
        else {
            return Err(etl_error!(
                ErrorKind::ConfigError,
                "Endpoint is not an HTTP endpoint",
                format!("Got a {} endpoint", endpoint.kind())
            ));
        };

        Ok(Self {
            url: url.clone(),
            headers: headers.clone(),
            bearer_token: bearer_token.clone(),
            timeout: Duration::from_millis(*timeout_ms),
        })
    }
}

/// Posts every batch as one JSON array.
///
/// Each element is the encoded message of one row, so JSON rules send their envelopes and
/// other encodings send strings.
#[derive(Debug, Clone)]
pub struct HttpDestination {
    settings: Arc<HttpSettings>,
    client: Client,
}

impl HttpDestination {
    pub fn new(settings: HttpSettings) -> EtlResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                etl_error!(ErrorKind::ConfigError, "Invalid HTTP header name", err)
            })?;
            let value = HeaderValue::from_str(value).map_err(|err| {
                etl_error!(ErrorKind::ConfigError, "Invalid HTTP header value", err)
            })?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| {
                EtlError::from((
                    ErrorKind::ConfigError,
                    "Cannot build the HTTP client",
                    err.to_string(),
                ))
            })?;

        Ok(Self {
            settings: Arc::new(settings),
            client,
        })
    }

    async fn post(&self, messages: Vec<Message>, processing_type: &'static str) -> EtlResult<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let body = json_array(&messages)?;
        let mut request = self
            .client
            .post(&self.settings.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.clone());
        if let Some(token) = &self.settings.bearer_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|err| {
            EtlError::from((
                ErrorKind::DestinationConnectionFailed,
                "HTTP endpoint is unreachable",
                err.to_string(),
            ))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(etl_error!(
                ErrorKind::DestinationQueryFailed,
                "HTTP endpoint rejected the batch",
                format!("{status}: {text}")
            ));
        }

        log_processed_bytes(
            Self::name(),
            processing_type,
            messages.len(),
            body.len() as u64,
            started.elapsed(),
        );

        Ok(())
    }
}

impl Destination for HttpDestination {
    fn name() -> &'static str {
        "http"
    }

    async fn connect(&self) -> EtlResult<()> {
        self.ping().await
    }

    /// Any HTTP answer counts as alive, since hooks rarely accept `HEAD`.
    async fn ping(&self) -> EtlResult<()> {
        self.client
            .request(Method::HEAD, &self.settings.url)
            .send()
            .await
            .map_err(|err| {
                EtlError::from((
                    ErrorKind::DestinationUnhealthy,
                    "HTTP endpoint is unreachable",
                    err.to_string(),
                ))
            })?;

        Ok(())
    }

    async fn write_rows(&self, requests: Vec<RowEventRequest>) -> EtlResult<()> {
        let mut outgoing = Vec::with_capacity(requests.len());
        for request in &requests {
            outgoing.extend(messages(&request.context, request, None)?);
        }

        debug!(rows = requests.len(), "posting rows to http endpoint");
        self.post(outgoing, PROCESSING_TYPE_STREAM).await
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

        self.post(outgoing, PROCESSING_TYPE_EXPORT).await?;

        Ok(requests.len())
    }
}
