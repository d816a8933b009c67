//! In-memory response cache backed by `DashMap`

use crate::stats::{AtomicCacheMetrics, CacheStats};
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// A cached response together with its freshness window.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Server-declared age of the data, expressed on the local monotonic clock
    pub data_timestamp: Instant,
    /// How long after `data_timestamp` the entry stays usable
    pub ttl: Duration,
    /// Opaque payload owned by the caller
    pub payload: V,
}

impl<V> CacheEntry<V> {
    /// Instant from which the entry is no longer served
    pub fn expires_at(&self) -> Instant {
        self.data_timestamp + self.ttl
    }

    /// `true` while `now < data_timestamp + ttl`
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at()
    }
}

/// Concurrent fingerprint -> response cache.
///
/// Lookups never remove anything; expired entries are only dropped by
/// [`sweep_expired`](Self::sweep_expired).
#[derive(Debug)]
pub struct ResponseCache<V> {
    storage: DashMap<String, CacheEntry<V>>,
    metrics: AtomicCacheMetrics,
}

impl<V> Default for ResponseCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ResponseCache<V> {
    pub fn new() -> Self {
        Self {
            storage: DashMap::new(),
            metrics: AtomicCacheMetrics::default(),
        }
    }

    /// Store (or overwrite) the entry for `key`.
    pub fn insert(&self, key: impl Into<String>, data_timestamp: Instant, ttl: Duration, payload: V) {
        self.storage.insert(
            key.into(),
            CacheEntry {
                data_timestamp,
                ttl,
                payload,
            },
        );
        self.metrics.record_put();
    }

    /// Drop every entry whose freshness window closed at or before `now`.
    ///
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.storage.len();
        self.storage.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.storage.len());

        if removed > 0 {
            self.metrics.record_expirations(removed as u64);
            #[cfg(feature = "tracing")]
            tracing::debug!(removed, remaining = self.storage.len(), "swept expired cache entries");
        }
        removed
    }

    /// Number of stored entries, including logically expired ones
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn clear(&self) {
        self.storage.clear();
        self.metrics.reset();
    }

    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot(self.storage.len())
    }
}

impl<V: Clone> ResponseCache<V> {
    /// Return the payload for `key` if a live entry exists at `now`.
    pub fn get(&self, key: &str, now: Instant) -> Option<V> {
        let hit = self
            .storage
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.payload.clone());
        self.metrics.record_get(hit.is_some());
        hit
    }
}
