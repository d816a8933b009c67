//! Completed responses and the rules that turn a raw HTTP exchange into one

use bytes::Bytes;
use chrono::DateTime;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::channel::QuotaHeaders;
use crate::error::{FetchError, Result};
use crate::transport::TransportResponse;

/// Accepted spellings of the remaining-quota header, most specific first
pub const HEADERS_REMAINING: &[&str] = &[
    "ratelimit-remaining",
    "x-ratelimit-remaining",
    "x-rate-limit-remaining",
];
pub const HEADERS_LIMIT: &[&str] = &["ratelimit-limit", "x-ratelimit-limit", "x-rate-limit-limit"];
/// Seconds until the server's window resets
pub const HEADER_RESET: &str = "ratelimit-reset";
/// Unix timestamp (seconds) at which the server's window resets
pub const HEADERS_RESET_AT: &[&str] = &["x-ratelimit-reset", "x-rate-limit-reset"];
pub const HEADER_VERSION: &str = "version";

/// Outcome of a successful fetch, shared by every caller that asked for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResult {
    pub requested_at: SystemTime,
    pub responded_at: SystemTime,
    pub received_at: SystemTime,
    /// Age of the data as declared by the server, never later than `received_at`
    pub data_timestamp: SystemTime,
    pub status: u16,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl RawResult {
    /// The resource does not exist upstream
    pub fn is_absent(&self) -> bool {
        self.status == 404
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// How long ago the server produced this data, as seen at `received_at`
    pub fn data_age(&self) -> Duration {
        self.received_at
            .duration_since(self.data_timestamp)
            .unwrap_or(Duration::ZERO)
    }
}

/// Wall-clock marks of one dispatch
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timing {
    pub requested_at: SystemTime,
    pub responded_at: SystemTime,
}

pub(crate) fn quota_headers(response: &TransportResponse, now: SystemTime) -> QuotaHeaders {
    let number = |names: &[&str]| {
        names.iter().find_map(|name| {
            response
                .header(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
        })
    };

    let reset_in = number(&[HEADER_RESET]).map(Duration::from_secs).or_else(|| {
        number(HEADERS_RESET_AT).and_then(|at| {
            let at = SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(at))?;
            at.duration_since(now).ok()
        })
    });

    QuotaHeaders {
        remaining: number(HEADERS_REMAINING).map(|v| u32::try_from(v).unwrap_or(u32::MAX)),
        limit: number(HEADERS_LIMIT).map(|v| u32::try_from(v).unwrap_or(u32::MAX)),
        reset_in,
    }
}

/// Turn a transport response into a result or an error.
///
/// Checks run in a fixed order: declared API version, upstream rate limit,
/// not-found, client errors, server errors. A rate-limit message in the body
/// only counts on a non-2xx response.
pub(crate) fn classify(
    response: TransportResponse,
    timing: Timing,
    expected_version: Option<&str>,
    credential: Option<&str>,
) -> Result<RawResult> {
    if let (Some(expected), Some(actual)) = (expected_version, response.header(HEADER_VERSION))
        && major(expected) != major(actual)
    {
        return Err(FetchError::UpstreamVersionMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    let success = (200..300).contains(&response.status);
    if response.status == 429 || (!success && body_signals_rate_limit(&response.body)) {
        return Err(FetchError::UpstreamRateLimited {
            credential: credential.map(str::to_string),
        });
    }

    match response.status {
        404 | 200..=299 => {}
        status @ 400..=499 => return Err(FetchError::HttpStatus(status)),
        status @ 500..=599 => return Err(FetchError::ServerError(status)),
        status => return Err(FetchError::HttpStatus(status)),
    }

    let received_at = SystemTime::now();
    let data_timestamp = response
        .header("date")
        .and_then(parse_http_date)
        .map_or(received_at, |declared| declared.min(received_at));

    Ok(RawResult {
        requested_at: timing.requested_at,
        responded_at: timing.responded_at,
        received_at,
        data_timestamp,
        status: response.status,
        headers: response.headers,
        body: response.body,
    })
}

fn major(version: &str) -> &str {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    trimmed.split('.').next().unwrap_or(trimmed)
}

fn body_signals_rate_limit(body: &[u8]) -> bool {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(body)
    else {
        return false;
    };

    ["error", "message"].iter().any(|field| {
        map.get(*field)
            .and_then(serde_json::Value::as_str)
            .is_some_and(mentions_rate_limit)
    })
}

fn mentions_rate_limit(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("ratelimit") || lower.contains("rate limit") || lower.contains("rate-limit")
}

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`
fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(SystemTime::from)
}
