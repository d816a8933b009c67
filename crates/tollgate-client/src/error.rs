//! Error types for fetch operations

use std::time::Duration;
use thiserror::Error;

/// Every way a `fetch` can fail.
///
/// The type is `Clone` because one dispatched request resolves every caller that
/// joined it, and each of them receives its own copy of the outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Queue is full ({max_queue_length} requests already waiting)")]
    CapacityExceeded { max_queue_length: usize },

    #[error("Unknown credential: {0}")]
    UnknownCredential(String),

    #[error("Upstream rate limit exhausted")]
    UpstreamRateLimited {
        /// Credential of the channel that hit the limit, `None` for the shared channel
        credential: Option<String>,
    },

    #[error("Upstream API version {actual} does not match expected {expected}")]
    UpstreamVersionMismatch { expected: String, actual: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP status: {0}")]
    HttpStatus(u16),

    #[error("Server error: {0}")]
    ServerError(u16),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Request was cancelled before completing")]
    Cancelled,
}

impl FetchError {
    /// Check if another transport attempt may succeed
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::ServerError(_)
        )
    }

    /// `true` for the two kinds decided at admission, before any network activity
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::UnknownCredential(_)
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() {
                Self::ServerError(status.as_u16())
            } else {
                Self::HttpStatus(status.as_u16())
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidRequest(format!("URL parse error: {err}"))
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
