//! Public entry point

use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tollgate_cache::CacheStats;

use crate::config::{ClientConfig, CredentialConfig};
use crate::error::{FetchError, Result};
use crate::metrics::SchedulerMetrics;
use crate::request::{FetchOptions, Fingerprint};
use crate::result::RawResult;
use crate::scheduler::Scheduler;
use crate::snapshot::SchedulerSnapshot;
use crate::transport::{HttpTransport, Transport};

/// Rate-limited, caching, de-duplicating client for one upstream API.
///
/// Cloning is cheap and every clone drives the same scheduler. Separate
/// `ApiClient::new` calls never share state.
#[derive(Clone)]
pub struct ApiClient {
    scheduler: Arc<Scheduler>,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::with_config(&config.http, config.credential_header.clone())?;
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let metrics = SchedulerMetrics::new()
            .map_err(|e| FetchError::InvalidConfig(format!("metrics registry: {e}")))?;

        tracing::debug!(
            base_url = %config.base_url,
            credentials = config.credentials.len(),
            "Creating API client"
        );

        Ok(Self {
            scheduler: Arc::new(Scheduler::new(config, transport, metrics)),
        })
    }

    /// Fetch a resource.
    ///
    /// Admission happens during this call: `CapacityExceeded` and
    /// `UnknownCredential` are already decided when it returns, and the
    /// returned future then resolves to them without any network activity.
    /// Must be called from within a tokio runtime.
    pub fn fetch(
        &self,
        fingerprint: impl Into<Fingerprint>,
        options: FetchOptions,
    ) -> BoxFuture<'static, Result<Arc<RawResult>>> {
        let fingerprint = fingerprint.into();
        let admission = options
            .resolve(self.scheduler.config(), &fingerprint)
            .and_then(|resolved| self.scheduler.admit(&fingerprint, resolved));

        match admission {
            Ok(admission) => admission.into_fetch(),
            Err(e) => futures::future::ready(Err(e)).boxed(),
        }
    }

    /// Render a configured route and fetch it
    pub fn fetch_route(
        &self,
        route: &str,
        params: &[(&str, &str)],
        options: FetchOptions,
    ) -> BoxFuture<'static, Result<Arc<RawResult>>> {
        let fingerprint = match self.scheduler.config().routes.get(route) {
            Some(config) => Fingerprint::from_template(route, &config.url_template, params),
            None => Err(FetchError::InvalidRequest(format!("unknown route: {route}"))),
        };

        match fingerprint {
            Ok(fingerprint) => self.fetch(fingerprint, options),
            Err(e) => futures::future::ready(Err(e)).boxed(),
        }
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.scheduler.snapshot()
    }

    /// Replace the configured credentials
    pub fn set_credentials(&self, credentials: Vec<CredentialConfig>) -> Result<()> {
        self.scheduler.set_credentials(&credentials)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.scheduler.cache_stats()
    }

    pub fn clear_cache(&self) {
        self.scheduler.clear_cache();
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        self.scheduler.metrics()
    }

    pub fn config(&self) -> &ClientConfig {
        self.scheduler.config()
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.scheduler.config().base_url)
            .finish_non_exhaustive()
    }
}
