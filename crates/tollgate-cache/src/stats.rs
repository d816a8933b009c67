//! Cache statistics
//!
//! Counters are plain relaxed atomics; a [`CacheStats`] value is a point-in-time
//! copy and may be slightly inconsistent under concurrent writers.

#![allow(clippy::cast_precision_loss)] // Ratios intentionally accept precision loss

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of lookups
    pub get_count: u64,
    /// Lookups answered by a live entry
    pub hit_count: u64,
    /// Lookups that found nothing or only an expired entry
    pub miss_count: u64,
    /// Total number of inserts (including overwrites)
    pub put_count: u64,
    /// Expired entries physically removed by sweeps
    pub expiration_count: u64,
    /// Entries currently stored, live or not
    pub entry_count: usize,
}

impl CacheStats {
    /// Hit rate as a percentage of all lookups
    pub fn hit_rate(&self) -> f64 {
        if self.get_count == 0 {
            0.0
        } else {
            (self.hit_count as f64) / (self.get_count as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct AtomicCacheMetrics {
    gets: AtomicU64,
    hits: AtomicU64,
    puts: AtomicU64,
    expirations: AtomicU64,
}

impl AtomicCacheMetrics {
    pub(crate) fn record_get(&self, hit: bool) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, entry_count: usize) -> CacheStats {
        let get_count = self.gets.load(Ordering::Relaxed);
        let hit_count = self.hits.load(Ordering::Relaxed);
        CacheStats {
            get_count,
            hit_count,
            miss_count: get_count.saturating_sub(hit_count),
            put_count: self.puts.load(Ordering::Relaxed),
            expiration_count: self.expirations.load(Ordering::Relaxed),
            entry_count,
        }
    }

    pub(crate) fn reset(&self) {
        self.gets.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.puts.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
    }
}
