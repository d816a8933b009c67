//! Prometheus metrics for the scheduler
//!
//! Each client owns a private registry so independent instances never share
//! counters.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    registry: Registry,

    fetches: IntCounter,
    cache_hits: IntCounter,
    joined: IntCounter,
    queued: IntCounter,
    capacity_rejections: IntCounter,
    transport_attempts: IntCounter,
    transport_failures: IntCounter,
    upstream_rate_limited: IntCounter,
    transport_latency: Histogram,

    ongoing: IntGauge,
    queue_depth: IntGauge,
}

impl SchedulerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let fetches = IntCounter::new("tollgate_fetches_total", "Fetch calls admitted or rejected")?;
        registry.register(Box::new(fetches.clone()))?;

        let cache_hits = IntCounter::new("tollgate_cache_hits_total", "Fetches served from cache")?;
        registry.register(Box::new(cache_hits.clone()))?;

        let joined = IntCounter::new(
            "tollgate_joined_total",
            "Fetches that joined an identical executing or queued request",
        )?;
        registry.register(Box::new(joined.clone()))?;

        let queued = IntCounter::new("tollgate_queued_total", "Requests that had to wait in a queue")?;
        registry.register(Box::new(queued.clone()))?;

        let capacity_rejections = IntCounter::new(
            "tollgate_capacity_rejections_total",
            "Fetches rejected because the queue was full",
        )?;
        registry.register(Box::new(capacity_rejections.clone()))?;

        let transport_attempts = IntCounter::new(
            "tollgate_transport_attempts_total",
            "Transport attempts including retries",
        )?;
        registry.register(Box::new(transport_attempts.clone()))?;

        let transport_failures = IntCounter::new(
            "tollgate_transport_failures_total",
            "Transport attempts that failed or timed out",
        )?;
        registry.register(Box::new(transport_failures.clone()))?;

        let upstream_rate_limited = IntCounter::new(
            "tollgate_upstream_rate_limited_total",
            "Responses signalling an exhausted upstream quota",
        )?;
        registry.register(Box::new(upstream_rate_limited.clone()))?;

        let transport_latency = Histogram::with_opts(
            HistogramOpts::new(
                "tollgate_transport_latency_seconds",
                "Latency of single transport attempts",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(transport_latency.clone()))?;

        let ongoing = IntGauge::new("tollgate_ongoing", "Requests currently executing")?;
        registry.register(Box::new(ongoing.clone()))?;

        let queue_depth = IntGauge::new("tollgate_queued", "Requests currently waiting")?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            fetches,
            cache_hits,
            joined,
            queued,
            capacity_rejections,
            transport_attempts,
            transport_failures,
            upstream_rate_limited,
            transport_latency,
            ongoing,
            queue_depth,
        })
    }

    pub fn record_fetch(&self) {
        self.fetches.inc();
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.inc();
    }

    pub fn record_joined(&self) {
        self.joined.inc();
    }

    pub fn record_queued(&self) {
        self.queued.inc();
    }

    pub fn record_capacity_rejection(&self) {
        self.capacity_rejections.inc();
    }

    pub fn record_attempt(&self, latency: Duration, failed: bool) {
        self.transport_attempts.inc();
        self.transport_latency.observe(latency.as_secs_f64());
        if failed {
            self.transport_failures.inc();
        }
    }

    pub fn record_upstream_rate_limited(&self) {
        self.upstream_rate_limited.inc();
    }

    /// Mirror the global counters into the gauges
    pub fn set_load(&self, ongoing: usize, queued: usize) {
        self.ongoing.set(i64::try_from(ongoing).unwrap_or(i64::MAX));
        self.queue_depth.set(i64::try_from(queued).unwrap_or(i64::MAX));
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }
}
