//! Transport layer: the single network primitive the scheduler depends on
//!
//! The scheduler only ever talks to a [`Transport`]. [`HttpTransport`] is the
//! production implementation over `reqwest`; tests and embedders can inject their
//! own.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;

use crate::error::{FetchError, Result};

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the ring crypto provider for rustls (idempotent)
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Another component may already have installed one; either way a provider exists.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// One transport attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    /// Fully resolved URL
    pub url: String,
    /// Credential of the channel the request was dispatched on
    pub credential: Option<String>,
    /// Budget for this attempt only
    pub timeout: Duration,
}

/// Raw response of a single attempt
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Executes a single HTTP attempt.
///
/// Implementations must not retry; the retry policy owns that. A timeout should
/// be reported as [`FetchError::Timeout`] and connection-level failures as
/// [`FetchError::Transport`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// `reqwest`-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    credential_header: String,
}

impl HttpTransport {
    pub fn new(credential_header: impl Into<String>) -> Result<Self> {
        Self::with_config(&HttpConfig::default(), credential_header)
    }

    pub fn with_config(config: &HttpConfig, credential_header: impl Into<String>) -> Result<Self> {
        ensure_crypto_provider();

        let client = ClientBuilder::new()
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(config.tcp_nodelay)
            .tcp_keepalive(config.tcp_keepalive)
            .gzip(config.enable_compression)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            credential_header: credential_header.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse> {
        tracing::debug!(url = %request.url, "HTTP request");

        let mut builder = self.client.get(&request.url).timeout(request.timeout);
        if let Some(credential) = &request.credential {
            builder = builder.header(self.credential_header.as_str(), format!("Bearer {credential}"));
        }

        let response = builder.send().await.map_err(|e| map_send_error(e, request.timeout))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_send_error(e, request.timeout))?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_send_error(err: reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout)
    } else {
        err.into()
    }
}

/// HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection pool idle timeout
    pub pool_idle_timeout: Duration,

    /// Maximum idle connections per host
    pub pool_max_idle_per_host: usize,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Enable `TCP_NODELAY` (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// TCP keep-alive duration
    pub tcp_keepalive: Option<Duration>,

    /// Accept gzip-compressed responses
    pub enable_compression: bool,

    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            pool_idle_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 10,
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            tcp_keepalive: Some(Duration::from_secs(60)),
            enable_compression: true,
            user_agent: concat!("tollgate-client/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
