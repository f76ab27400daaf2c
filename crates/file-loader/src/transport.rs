//! # Transport
//!
//! A single-shot request/response primitive. Implementations must never
//! follow redirects on their own: the loader inspects every 3xx response and
//! decides whether to issue the next hop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Client, StatusCode};
use rustls::ClientConfig;
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::debug;
use url::Url;

use crate::LoaderConfig;
use crate::error::TransportError;
use crate::progress::{Progress, ProgressSink};

/// Caller-supplied options passed through to the transport.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Overrides the configured transport timeout for this request
    pub timeout: Option<Duration>,
    /// Extra request headers (auth tokens and the like)
    pub headers: HeaderMap,
    /// HTTP basic credentials
    pub basic_auth: Option<(String, Option<String>)>,
}

impl TransportOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a header, ignoring names or values that are not valid HTTP.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            reqwest::header::HeaderValue::from_str(value.as_ref()),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.basic_auth = Some((username.into(), password));
        self
    }
}

/// Response to a single transport request.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    /// Raw `Location` header, if any
    pub location: Option<String>,
    /// Response body; empty for redirects and failures
    pub body: Bytes,
}

impl TransportResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            location: None,
            body: body.into(),
        }
    }

    pub fn redirect(status: StatusCode, location: impl Into<String>) -> Self {
        Self {
            status,
            location: Some(location.into()),
            body: Bytes::new(),
        }
    }

    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            location: None,
            body: Bytes::new(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one request for `url`. `timeout` is the effective timeout the
    /// loader resolved from the options and its configuration.
    async fn fetch(
        &self,
        url: &Url,
        options: &TransportOptions,
        timeout: Duration,
        progress: &ProgressSink,
    ) -> Result<TransportResponse, TransportError>;
}

/// Create a reqwest Client that never follows redirects.
pub fn create_client(config: &LoaderConfig) -> Result<Client, TransportError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Other(format!("TLS configuration failed: {e}")))?
        .with_platform_verifier()
        .map_err(|e| TransportError::Other(format!("TLS verifier setup failed: {e}")))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .user_agent(&config.user_agent)
        .use_preconfigured_tls(tls_config)
        .redirect(reqwest::redirect::Policy::none());

    if !config.timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.timeout);
    }

    client_builder.build().map_err(TransportError::from)
}

/// [`Transport`] over a shared reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &LoaderConfig) -> Result<Self, TransportError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    /// Wrap an existing client. The client must have redirects disabled.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn map_request_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            after: timeout,
            source: Arc::new(err),
        }
    } else {
        TransportError::from(err)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(
        &self,
        url: &Url,
        options: &TransportOptions,
        timeout: Duration,
        progress: &ProgressSink,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self
            .client
            .get(url.clone())
            .headers(options.headers.clone());
        if !timeout.is_zero() {
            request = request.timeout(timeout);
        }
        if let Some((username, password)) = &options.basic_auth {
            request = request.basic_auth(username, password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_request_error(e, timeout))?;

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        if !status.is_success() {
            debug!(url = %url, status = %status, "Non-success response");
            return Ok(TransportResponse {
                status,
                location,
                body: Bytes::new(),
            });
        }

        let total = response.content_length();
        let capacity = total.unwrap_or(0).min(8 * 1024 * 1024) as usize;
        let mut body = BytesMut::with_capacity(capacity);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_request_error(e, timeout))?;
            body.extend_from_slice(&chunk);
            progress.report(Progress {
                received: body.len() as u64,
                total,
            });
        }

        debug!(url = %url, size = body.len(), "Fetched response body");
        Ok(TransportResponse {
            status,
            location,
            body: body.freeze(),
        })
    }
}
