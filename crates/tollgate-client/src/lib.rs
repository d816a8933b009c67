//! # tollgate-client
//!
//! Admission, scheduling, de-duplication and caching in front of a
//! rate-limited HTTP JSON API.
//!
//! Every [`ApiClient::fetch`] goes through the same gate:
//!
//! 1. An identical request that is already executing is joined.
//! 2. An identical request that is still queued is joined (and moved to the
//!    priority queue if the new caller asked for priority).
//! 3. A live cache entry is returned without touching the network.
//! 4. Otherwise a rate-limit channel is selected and the request is either
//!    dispatched at once or queued behind that channel's quota.
//!
//! There is one channel per configured credential plus a shared channel used
//! when no credentials exist. Across all channels at most
//! [`GLOBAL_CONCURRENCY_CAP`] requests execute concurrently, and at most
//! `max_queue_length` requests may wait; beyond that admission fails with
//! [`FetchError::CapacityExceeded`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tollgate_client::{ApiClient, ClientConfig, FetchOptions};
//!
//! # async fn example() -> tollgate_client::Result<()> {
//! let config = ClientConfig::default()
//!     .with_route("player", "/v3/player/{player}", Duration::from_secs(120))
//!     .with_credential("my-api-key", 120, Duration::from_secs(60));
//! let client = ApiClient::new(config)?;
//!
//! let result = client
//!     .fetch_route("player", &[("player", "Salted")], FetchOptions::new().priority(true))
//!     .await?;
//! if !result.is_absent() {
//!     let player: serde_json::Value = result.json()?;
//!     println!("{player}");
//! }
//!
//! println!("{:?}", client.snapshot());
//! # Ok(())
//! # }
//! ```

mod channel;
mod registry;
mod scheduler;
mod throttle;

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod request;
pub mod result;
pub mod retry;
pub mod snapshot;
pub mod transport;

pub use client::ApiClient;
pub use config::{ChannelLimits, ClientConfig, CredentialConfig, RouteConfig};
pub use error::{FetchError, Result};
pub use metrics::SchedulerMetrics;
pub use request::{FetchOptions, Fingerprint};
pub use result::RawResult;
pub use retry::{Backoff, RetryPolicy};
pub use snapshot::{ChannelSnapshot, SchedulerSnapshot};
pub use throttle::GLOBAL_CONCURRENCY_CAP;
pub use transport::{HttpConfig, HttpTransport, Transport, TransportRequest, TransportResponse};

pub use tollgate_cache::CacheStats;
