//! Configuration structures for the API client

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::error::{FetchError, Result};
use crate::retry::Backoff;
use crate::transport::HttpConfig;

/// Top-level client configuration.
///
/// Read-only once handed to [`ApiClient`](crate::ApiClient); credentials are the
/// only part that can change afterwards, through
/// [`ApiClient::set_credentials`](crate::ApiClient::set_credentials).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL every fingerprint is appended to
    pub base_url: String,

    /// Named routes with their URL template and default cache time
    pub routes: BTreeMap<String, RouteConfig>,

    /// Cache time for fingerprints that do not name a route
    pub default_cache_time: Duration,

    /// Maximum number of requests waiting across all channels
    pub max_queue_length: usize,

    /// Transport retries after the first attempt
    pub default_retries: u32,

    /// Budget for a single transport attempt
    pub default_timeout: Duration,

    /// Pause between transport retries
    #[serde(default)]
    pub retry_backoff: Backoff,

    /// Whether fetches may be answered from cache unless told otherwise
    pub allow_cache_by_default: bool,

    /// Return `UpstreamRateLimited` instead of waiting for the channel reset
    pub throw_on_ratelimit_error: bool,

    /// Quota of the shared channel used when no credential applies
    pub default_channel: ChannelLimits,

    /// One rate-limit channel per credential
    pub credentials: Vec<CredentialConfig>,

    /// API version this client was written against (major component is compared)
    pub expected_api_version: Option<String>,

    /// Header carrying the credential, sent as `Bearer <id>`
    pub credential_header: String,

    /// HTTP transport tuning
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.wynncraft.com".to_string(),
            routes: BTreeMap::new(),
            default_cache_time: Duration::from_secs(60),
            max_queue_length: 100,
            default_retries: 2,
            default_timeout: Duration::from_secs(10),
            retry_backoff: Backoff::default(),
            allow_cache_by_default: true,
            throw_on_ratelimit_error: false,
            default_channel: ChannelLimits::default(),
            credentials: Vec::new(),
            expected_api_version: None,
            credential_header: "Authorization".to_string(),
            http: HttpConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create configuration from `TOLLGATE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_prefix("TOLLGATE")
    }

    /// Create configuration from `{prefix}_*` environment variables.
    ///
    /// Unset or malformed values fall back to the defaults.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self> {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(format!("{prefix}_{name}")).ok();
        let parsed = |name: &str| var(name).and_then(|s| s.trim().parse::<u64>().ok());

        let config = Self {
            base_url: var("BASE_URL").unwrap_or(defaults.base_url),
            routes: defaults.routes,
            default_cache_time: parsed("DEFAULT_CACHE_TIME_MS")
                .map_or(defaults.default_cache_time, Duration::from_millis),
            max_queue_length: var("MAX_QUEUE_LENGTH")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.max_queue_length),
            default_retries: var("DEFAULT_RETRIES")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.default_retries),
            default_timeout: parsed("DEFAULT_TIMEOUT_MS")
                .map_or(defaults.default_timeout, Duration::from_millis),
            retry_backoff: Backoff::from_env_with_prefix(prefix),
            allow_cache_by_default: var("ALLOW_CACHE")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.allow_cache_by_default),
            throw_on_ratelimit_error: var("THROW_ON_RATELIMIT")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.throw_on_ratelimit_error),
            default_channel: ChannelLimits {
                limit: var("DEFAULT_LIMIT")
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(defaults.default_channel.limit),
                interval: parsed("DEFAULT_INTERVAL_MS")
                    .map_or(defaults.default_channel.interval, Duration::from_millis),
            },
            credentials: var("CREDENTIALS")
                .map(|s| parse_credentials(&s))
                .unwrap_or_default(),
            expected_api_version: var("API_VERSION").filter(|s| !s.trim().is_empty()),
            credential_header: var("CREDENTIAL_HEADER").unwrap_or(defaults.credential_header),
            http: defaults.http,
        };

        Ok(config)
    }

    /// Register a route template, e.g. `/v3/player/{player}`.
    #[must_use]
    pub fn with_route(
        mut self,
        name: impl Into<String>,
        url_template: impl Into<String>,
        default_cache_time: Duration,
    ) -> Self {
        self.routes.insert(
            name.into(),
            RouteConfig {
                url_template: url_template.into(),
                default_cache_time,
            },
        );
        self
    }

    #[must_use]
    pub fn with_credential(mut self, id: impl Into<String>, limit: u32, interval: Duration) -> Self {
        self.credentials.push(CredentialConfig {
            id: id.into(),
            limit,
            interval,
        });
        self
    }

    /// Reject configurations the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(FetchError::InvalidConfig("base_url is empty".to_string()));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| FetchError::InvalidConfig(format!("base_url: {e}")))?;

        if self.max_queue_length == 0 {
            return Err(FetchError::InvalidConfig(
                "max_queue_length must be at least 1".to_string(),
            ));
        }
        if self.default_timeout.is_zero() {
            return Err(FetchError::InvalidConfig(
                "default_timeout must be non-zero".to_string(),
            ));
        }

        self.retry_backoff.validate()?;
        self.default_channel.validate("default channel")?;
        validate_credentials(&self.credentials)?;

        for (name, route) in &self.routes {
            if !braces_balanced(&route.url_template) {
                return Err(FetchError::InvalidConfig(format!(
                    "route {name}: unbalanced braces in {}",
                    route.url_template
                )));
            }
        }

        Ok(())
    }
}

/// Longest quota interval a channel may be configured with
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Quota parameters of a rate-limit channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLimits {
    /// Requests allowed per interval
    pub limit: u32,
    /// Length of one quota interval
    pub interval: Duration,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            limit: 50,
            interval: Duration::from_secs(60),
        }
    }
}

impl ChannelLimits {
    fn validate(&self, what: &str) -> Result<()> {
        if self.limit == 0 {
            return Err(FetchError::InvalidConfig(format!("{what}: limit must be at least 1")));
        }
        if self.interval.is_zero() {
            return Err(FetchError::InvalidConfig(format!("{what}: interval must be non-zero")));
        }
        if self.interval > MAX_INTERVAL {
            return Err(FetchError::InvalidConfig(format!(
                "{what}: interval {:?} exceeds {MAX_INTERVAL:?}",
                self.interval
            )));
        }
        Ok(())
    }
}

/// A single API credential and the quota attached to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub id: String,
    pub limit: u32,
    pub interval: Duration,
}

impl CredentialConfig {
    pub fn limits(&self) -> ChannelLimits {
        ChannelLimits {
            limit: self.limit,
            interval: self.interval,
        }
    }
}

/// A named route: URL template plus the cache time applied to its responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub url_template: String,
    pub default_cache_time: Duration,
}

pub(crate) fn validate_credentials(credentials: &[CredentialConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for credential in credentials {
        if credential.id.trim().is_empty() {
            return Err(FetchError::InvalidConfig("credential id is empty".to_string()));
        }
        if !seen.insert(credential.id.as_str()) {
            return Err(FetchError::InvalidConfig(format!(
                "duplicate credential: {}",
                credential.id
            )));
        }
        credential
            .limits()
            .validate(&format!("credential {}", credential.id))?;
    }
    Ok(())
}

/// Parse `id:limit:interval_ms` entries separated by commas
fn parse_credentials(raw: &str) -> Vec<CredentialConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let mut parts = entry.split(':').map(str::trim);
            let id = parts.next()?.to_string();
            let limit = parts.next()?.parse().ok();
            let interval_ms: Option<u64> = parts.next()?.parse().ok();
            match (limit, interval_ms) {
                (Some(limit), Some(interval_ms)) if !id.is_empty() => Some(CredentialConfig {
                    id,
                    limit,
                    interval: Duration::from_millis(interval_ms),
                }),
                _ => {
                    tracing::warn!(entry, "ignoring malformed credential entry");
                    None
                }
            }
        })
        .collect()
}

fn braces_balanced(template: &str) -> bool {
    let mut open = false;
    for c in template.chars() {
        match c {
            '{' if open => return false,
            '{' => open = true,
            '}' if !open => return false,
            '}' => open = false,
            _ => {}
        }
    }
    !open
}
