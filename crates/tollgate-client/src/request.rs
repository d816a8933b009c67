//! Request identity and per-call options

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::{FetchError, Result};

/// Identity of a logical request.
///
/// `path` is the fully resolved route string and is the cache and
/// de-duplication key. `route` names the configured route it was rendered
/// from, which selects that route's default cache time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub path: String,
    pub route: Option<String>,
}

impl Fingerprint {
    pub fn for_route(route: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            route: Some(route.into()),
        }
    }

    /// Render a configured route template into a fingerprint.
    ///
    /// Every `{name}` placeholder must have a matching parameter; values are
    /// percent-encoded.
    pub fn from_template(route: &str, template: &str, params: &[(&str, &str)]) -> Result<Self> {
        let mut path = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            path.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                FetchError::InvalidRequest(format!("route {route}: unbalanced braces"))
            })?;
            let name = &after[..close];
            let value = params
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| *value)
                .ok_or_else(|| {
                    FetchError::InvalidRequest(format!("route {route}: missing parameter {name}"))
                })?;
            path.push_str(&encode_segment(value));
            rest = &after[close + 1..];
        }
        path.push_str(rest);

        Ok(Self::for_route(route, path))
    }
}

impl From<&str> for Fingerprint {
    fn from(path: &str) -> Self {
        Self {
            path: path.to_string(),
            route: None,
        }
    }
}

impl From<String> for Fingerprint {
    fn from(path: String) -> Self {
        Self { path, route: None }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

fn encode_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Options for a single [`fetch`](crate::ApiClient::fetch).
///
/// Unset fields fall back to the client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Pin the request to this credential's channel
    pub credential: Option<String>,
    pub allow_cache: Option<bool>,
    /// Join an identical queued request instead of queueing another (default `true`)
    pub allow_stacking: Option<bool>,
    pub priority: bool,
    pub retries: Option<u32>,
    /// Per-attempt timeout
    pub timeout: Option<Duration>,
    /// Cache time overriding the route default
    pub cache_for: Option<Duration>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn credential(mut self, id: impl Into<String>) -> Self {
        self.credential = Some(id.into());
        self
    }

    #[must_use]
    pub fn allow_cache(mut self, allow: bool) -> Self {
        self.allow_cache = Some(allow);
        self
    }

    #[must_use]
    pub fn allow_stacking(mut self, allow: bool) -> Self {
        self.allow_stacking = Some(allow);
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn cache_for(mut self, ttl: Duration) -> Self {
        self.cache_for = Some(ttl);
        self
    }

    /// Apply configuration defaults and validate.
    pub(crate) fn resolve(&self, config: &ClientConfig, fingerprint: &Fingerprint) -> Result<ResolvedOptions> {
        let timeout = self.timeout.unwrap_or(config.default_timeout);
        if timeout.is_zero() {
            return Err(FetchError::InvalidRequest("timeout must be non-zero".to_string()));
        }
        if fingerprint.path.is_empty() {
            return Err(FetchError::InvalidRequest("empty fingerprint".to_string()));
        }

        let route_ttl = fingerprint
            .route
            .as_ref()
            .and_then(|name| config.routes.get(name))
            .map(|route| route.default_cache_time);

        Ok(ResolvedOptions {
            credential: self.credential.clone(),
            allow_cache: self.allow_cache.unwrap_or(config.allow_cache_by_default),
            allow_stacking: self.allow_stacking.unwrap_or(true),
            priority: self.priority,
            retries: self.retries.unwrap_or(config.default_retries),
            timeout,
            cache_for: self
                .cache_for
                .or(route_ttl)
                .unwrap_or(config.default_cache_time),
        })
    }
}

/// [`FetchOptions`] with every default applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedOptions {
    pub credential: Option<String>,
    pub allow_cache: bool,
    pub allow_stacking: bool,
    pub priority: bool,
    pub retries: u32,
    pub timeout: Duration,
    pub cache_for: Duration,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_template_rendering_encodes_values() {
        let fp = Fingerprint::from_template(
            "guild",
            "/v3/guild/{name}?identifier={id}",
            &[("name", "The Aquarium"), ("id", "uuid")],
        )
        .expect("rendered");

        assert_eq!(fp.path, "/v3/guild/The%20Aquarium?identifier=uuid");
        assert_eq!(fp.route.as_deref(), Some("guild"));
    }

    #[test]
    fn test_template_missing_parameter() {
        let err = Fingerprint::from_template("player", "/v3/player/{player}", &[])
            .expect_err("missing");
        assert!(matches!(err, FetchError::InvalidRequest(msg) if msg.contains("player")));
    }

    #[test]
    fn test_template_unbalanced() {
        let err = Fingerprint::from_template("broken", "/v3/{oops", &[("oops", "x")])
            .expect_err("unbalanced");
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let config = ClientConfig::default();
        let resolved = FetchOptions::new()
            .resolve(&config, &"/v3/news".into())
            .expect("resolved");

        assert_eq!(resolved.credential, None);
        assert!(resolved.allow_cache);
        assert!(resolved.allow_stacking);
        assert!(!resolved.priority);
        assert_eq!(resolved.retries, config.default_retries);
        assert_eq!(resolved.timeout, config.default_timeout);
        assert_eq!(resolved.cache_for, config.default_cache_time);
    }

    #[test]
    fn test_resolve_route_and_override_cache_time() {
        let config = ClientConfig::default().with_route(
            "player",
            "/v3/player/{player}",
            Duration::from_secs(120),
        );
        let fp = Fingerprint::for_route("player", "/v3/player/Salted");

        let resolved = FetchOptions::new().resolve(&config, &fp).expect("resolved");
        assert_eq!(resolved.cache_for, Duration::from_secs(120));

        let resolved = FetchOptions::new()
            .cache_for(Duration::from_secs(5))
            .resolve(&config, &fp)
            .expect("resolved");
        assert_eq!(resolved.cache_for, Duration::from_secs(5));
    }

    #[test]
    fn test_resolve_rejects_zero_timeout() {
        let err = FetchOptions::new()
            .timeout(Duration::ZERO)
            .resolve(&ClientConfig::default(), &"/x".into())
            .expect_err("zero timeout");
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }
}
