//! Fingerprint-keyed response cache for rate-limited API clients
//!
//! Entries carry the server-declared data timestamp and a TTL. An entry is
//! served only while `now < data_timestamp + ttl`; once that boundary passes it
//! is logically dead but stays in the map until [`ResponseCache::sweep_expired`]
//! runs. The caller decides when to sweep, which keeps cleanup cost tied to
//! traffic rather than to a background timer.
//!
//! ```rust
//! use std::time::{Duration, Instant};
//! use tollgate_cache::ResponseCache;
//!
//! let cache = ResponseCache::new();
//! let now = Instant::now();
//! cache.insert("/v3/player/Salted", now, Duration::from_secs(60), "payload");
//!
//! assert_eq!(cache.get("/v3/player/Salted", now), Some("payload"));
//! assert_eq!(cache.get("/v3/player/Salted", now + Duration::from_secs(61)), None);
//! assert_eq!(cache.sweep_expired(now + Duration::from_secs(61)), 1);
//! ```

pub mod memory;
pub mod stats;

pub use memory::{CacheEntry, ResponseCache};
pub use stats::CacheStats;
