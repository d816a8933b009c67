//! Shared fixtures for the integration tests

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tollgate_client::{
    ApiClient, ChannelLimits, ClientConfig, FetchError, Result, Transport, TransportRequest,
    TransportResponse,
};

pub const BASE_URL: &str = "https://api.test";

/// One observed transport call
#[derive(Debug, Clone)]
pub struct Call {
    pub request: TransportRequest,
    pub at: Instant,
}

impl Call {
    pub fn path(&self) -> &str {
        self.request
            .url
            .strip_prefix(BASE_URL)
            .unwrap_or(&self.request.url)
    }
}

/// In-process transport that replays scripted outcomes.
///
/// Calls are recorded when they start. Scripted outcomes are consumed in
/// order; once the script is empty every call gets the default response.
pub struct MockTransport {
    calls: Mutex<Vec<Call>>,
    script: Mutex<VecDeque<Result<TransportResponse>>>,
    default: TransportResponse,
    delay: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            default: response(200, &[], "{}"),
            delay: Duration::ZERO,
        }
    }

    /// Time every call spends "on the wire"
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: TransportResponse) -> Self {
        self.default = default;
        self
    }

    #[must_use]
    pub fn then(self, outcome: Result<TransportResponse>) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn paths(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.path().to_string()).collect()
    }

    pub fn credentials(&self) -> Vec<Option<String>> {
        self.calls()
            .iter()
            .map(|c| c.request.credential.clone())
            .collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse> {
        self.calls.lock().push(Call {
            request,
            at: Instant::now(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(self.default.clone()))
    }
}

pub fn response(status: u16, headers: &[(&str, &str)], body: &str) -> TransportResponse {
    TransportResponse {
        status,
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), (*v).to_string()))
            .collect::<HashMap<_, _>>(),
        body: Bytes::from(body.to_string()),
    }
}

/// A success that reports `remaining` quota left
pub fn with_remaining(remaining: u32) -> TransportResponse {
    response(200, &[("ratelimit-remaining", &remaining.to_string())], "{}")
}

pub fn transport_error() -> Result<TransportResponse> {
    Err(FetchError::Transport("connection reset".to_string()))
}

/// Configuration pointing at the mock with a one-minute shared channel
pub fn config(limit: u32) -> ClientConfig {
    ClientConfig {
        base_url: BASE_URL.to_string(),
        default_channel: ChannelLimits {
            limit,
            interval: Duration::from_secs(60),
        },
        ..ClientConfig::default()
    }
}

pub fn client(config: ClientConfig, transport: &Arc<MockTransport>) -> ApiClient {
    init_tracing();
    ApiClient::with_transport(config, Arc::clone(transport) as Arc<dyn Transport>)
        .expect("valid configuration")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let spawned tasks run until they block on something
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
