//! Admission, de-duplication, queueing and dispatch
//!
//! All mutable state lives behind one mutex that is never held across an
//! await point. Every admitted request runs as its own task; callers hold a
//! [`SharedFetch`] that resolves once that task finishes, so any number of
//! de-duplicated callers observe the same outcome.
//!
//! Queued tasks sleep on a [`Notify`] that fires whenever capacity may have
//! appeared (completion, pop, escalation, quota reset, reconfiguration), with
//! a timer as fallback.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tollgate_cache::{CacheStats, ResponseCache};
use tracing::{debug, info, warn};

use crate::channel::{QueueKind, QueuedRequest};
use crate::config::{ClientConfig, CredentialConfig, validate_credentials};
use crate::error::{FetchError, Result};
use crate::metrics::SchedulerMetrics;
use crate::registry::{ChannelKey, ChannelRegistry};
use crate::request::{Fingerprint, ResolvedOptions};
use crate::result::{self, RawResult, Timing};
use crate::retry::RetryPolicy;
use crate::snapshot::{ChannelSnapshot, SchedulerSnapshot};
use crate::throttle::GlobalThrottle;
use crate::transport::{Transport, TransportRequest, TransportResponse};

/// Outcome handle shared by every caller of one logical request
pub type SharedFetch = Shared<BoxFuture<'static, Result<Arc<RawResult>>>>;

/// Re-check interval while a channel might have capacity
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// What admission decided for one fetch call
#[derive(Debug)]
pub enum Admission {
    /// Served from cache without touching the network
    Cached(Arc<RawResult>),
    /// Attached to an identical executing or queued request
    Joined(SharedFetch),
    Dispatched(SharedFetch),
    Queued(SharedFetch),
}

impl Admission {
    pub fn into_fetch(self) -> BoxFuture<'static, Result<Arc<RawResult>>> {
        match self {
            Self::Cached(result) => futures::future::ready(Ok(result)).boxed(),
            Self::Joined(handle) | Self::Dispatched(handle) | Self::Queued(handle) => handle.boxed(),
        }
    }
}

struct Ongoing {
    id: u64,
    handle: SharedFetch,
}

struct State {
    registry: ChannelRegistry,
    throttle: GlobalThrottle,
    /// Executing requests by fingerprint
    ongoing: HashMap<String, Ongoing>,
    /// Queued requests failed by reconfiguration, picked up by their own task
    evicted: HashMap<u64, FetchError>,
    next_id: u64,
}

impl State {
    fn release(&mut self, slot: &Slot) {
        if let Some(channel) = self
            .registry
            .get_mut(slot.channel.as_deref())
            .filter(|c| c.epoch == slot.epoch)
        {
            channel.ongoing = channel.ongoing.saturating_sub(1);
        }
        self.throttle.end_dispatch();
    }

    fn occupy(&mut self, key: ChannelKey) -> Option<Slot> {
        let channel = self.registry.get_mut(key.as_deref())?;
        channel.ongoing += 1;
        let epoch = channel.epoch;
        self.throttle.begin_dispatch();
        Some(Slot { channel: key, epoch })
    }
}

/// Claim on one unit of a channel's concurrency while a request executes
#[derive(Debug, Clone)]
struct Slot {
    channel: ChannelKey,
    epoch: u64,
}

struct Job {
    id: u64,
    fingerprint: String,
    url: String,
    options: ResolvedOptions,
}

pub struct Scheduler {
    state: Mutex<State>,
    capacity: Notify,
    cache: ResponseCache<Arc<RawResult>>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    metrics: SchedulerMetrics,
}

impl Scheduler {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>, metrics: SchedulerMetrics) -> Self {
        let registry = ChannelRegistry::new(config.default_channel, &config.credentials, Instant::now());
        Self {
            state: Mutex::new(State {
                registry,
                throttle: GlobalThrottle::default(),
                ongoing: HashMap::new(),
                evicted: HashMap::new(),
                next_id: 0,
            }),
            capacity: Notify::new(),
            cache: ResponseCache::new(),
            transport,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Decide what happens to one fetch call.
    ///
    /// Checks run in a fixed order: executing duplicate, queued duplicate,
    /// cache, then a new request on the selected channel. Capacity and
    /// credential errors are returned here, before any network activity.
    pub fn admit(self: &Arc<Self>, fingerprint: &Fingerprint, options: ResolvedOptions) -> Result<Admission> {
        let runtime = Handle::try_current()
            .map_err(|_| FetchError::InvalidRequest("fetch requires a tokio runtime".to_string()))?;
        let url = self.resolve_url(&fingerprint.path)?;
        let key = fingerprint.path.as_str();
        self.metrics.record_fetch();

        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.catch_up(state, now);

        if let Some(ongoing) = state.ongoing.get(key) {
            debug!(fingerprint = %key, "Joining executing request");
            self.metrics.record_joined();
            return Ok(Admission::Joined(ongoing.handle.clone()));
        }

        if options.allow_stacking {
            if let Some(found) = state.registry.find_queued(key) {
                if options.priority && found.kind == QueueKind::Normal {
                    if let Some(channel) = state.registry.get_mut(found.channel.as_deref()) {
                        channel.escalate(found.id);
                    }
                    debug!(fingerprint = %key, id = found.id, "Escalated queued request to priority");
                    self.capacity.notify_waiters();
                }
                self.metrics.record_joined();
                return Ok(Admission::Joined(found.handle));
            }
        }

        if options.allow_cache {
            if let Some(hit) = self.cache.get(key, now.into_std()) {
                debug!(fingerprint = %key, "Cache hit");
                self.metrics.record_cache_hit();
                return Ok(Admission::Cached(hit));
            }
        }

        let channel_key = state.registry.select(options.credential.as_deref())?;
        let (has_capacity, waiting_ahead) = state
            .registry
            .get(channel_key.as_deref())
            .map(|c| (c.has_capacity(), c.has_waiting_ahead_of(options.priority)))
            .ok_or_else(|| {
                FetchError::UnknownCredential(channel_key.clone().unwrap_or_default())
            })?;
        let immediate = has_capacity && !waiting_ahead && state.throttle.concurrency_available();

        if !immediate && state.throttle.queue_full(self.config.max_queue_length) {
            debug!(fingerprint = %key, "Queue full, rejecting");
            self.metrics.record_capacity_rejection();
            return Err(FetchError::CapacityExceeded {
                max_queue_length: self.config.max_queue_length,
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        let job = Job {
            id,
            fingerprint: key.to_string(),
            url,
            options,
        };
        let is_priority = job.options.priority;
        let pinned = job.options.credential.clone();

        let admission = if immediate {
            let slot = state
                .occupy(channel_key.clone())
                .ok_or_else(|| FetchError::UnknownCredential(channel_key.clone().unwrap_or_default()))?;
            let handle = self.spawn(&runtime, job, Some(slot));
            state.ongoing.insert(
                key.to_string(),
                Ongoing {
                    id,
                    handle: handle.clone(),
                },
            );
            debug!(fingerprint = %key, channel = ?channel_key, "Dispatching immediately");
            Admission::Dispatched(handle)
        } else {
            let handle = self.spawn(&runtime, job, None);
            if let Some(channel) = state.registry.get_mut(channel_key.as_deref()) {
                channel.enqueue(QueuedRequest {
                    id,
                    fingerprint: key.to_string(),
                    enqueued_at: now,
                    is_priority,
                    pinned,
                    handle: handle.clone(),
                });
            }
            state.throttle.enqueued();
            self.metrics.record_queued();
            debug!(fingerprint = %key, channel = ?channel_key, is_priority, "Queued");
            Admission::Queued(handle)
        };

        self.publish_load(state);
        Ok(admission)
    }

    fn spawn(self: &Arc<Self>, runtime: &Handle, job: Job, slot: Option<Slot>) -> SharedFetch {
        let scheduler = Arc::clone(self);
        runtime
            .spawn(async move { scheduler.run(job, slot).await })
            .map(|joined| joined.unwrap_or_else(|_| Err(FetchError::Cancelled)))
            .boxed()
            .shared()
    }

    async fn run(&self, job: Job, slot: Option<Slot>) -> Result<Arc<RawResult>> {
        let slot = match slot {
            Some(slot) => slot,
            None => self.wait_for_turn(&job).await?,
        };

        let mut guard = DispatchGuard {
            scheduler: self,
            id: job.id,
            fingerprint: &job.fingerprint,
            slot: Some(slot),
            settled: false,
        };
        let outcome = self.dispatch(&job, &mut guard).await;
        guard.settle(outcome.as_ref().ok().map(|r| (r, job.options.cache_for)));
        outcome
    }

    /// Execute the request, waiting out upstream rate limits unless told to fail
    async fn dispatch(&self, job: &Job, guard: &mut DispatchGuard<'_>) -> Result<Arc<RawResult>> {
        loop {
            let slot = guard.slot.clone().ok_or(FetchError::Cancelled)?;
            match self.invoke(job, &slot).await {
                Err(FetchError::UpstreamRateLimited { credential })
                    if !self.config.throw_on_ratelimit_error =>
                {
                    warn!(
                        fingerprint = %job.fingerprint,
                        channel = ?credential,
                        "Upstream rate limit hit, waiting for quota reset"
                    );
                    guard.release_slot();
                    guard.slot = Some(self.wait_for_reset(job, &slot).await?);
                }
                outcome => return outcome.map(Arc::new),
            }
        }
    }

    /// Run the transport under the retry policy, folding quota headers in after
    /// every attempt that produced a response
    async fn invoke(&self, job: &Job, slot: &Slot) -> Result<RawResult> {
        let requested_at = SystemTime::now();
        let policy = RetryPolicy::new(job.options.retries, job.options.timeout)
            .with_backoff(self.config.retry_backoff);
        let credential = slot.channel.as_deref();
        let request = TransportRequest {
            url: job.url.clone(),
            credential: slot.channel.clone(),
            timeout: job.options.timeout,
        };

        policy
            .execute(|attempt| {
                let request = request.clone();
                async move {
                    debug!(url = %request.url, attempt, "Transport attempt");
                    let started = Instant::now();
                    let outcome = self.transport.execute(request).await;
                    self.metrics.record_attempt(started.elapsed(), outcome.is_err());
                    let response = outcome?;

                    self.apply_quota(slot, &response);
                    let timing = Timing {
                        requested_at,
                        responded_at: SystemTime::now(),
                    };
                    let classified = result::classify(
                        response,
                        timing,
                        self.config.expected_api_version.as_deref(),
                        credential,
                    );
                    if matches!(classified, Err(FetchError::UpstreamRateLimited { .. })) {
                        self.mark_exhausted(slot);
                    }
                    classified
                }
            })
            .await
    }

    fn apply_quota(&self, slot: &Slot, response: &TransportResponse) {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state
            .registry
            .get_mut(slot.channel.as_deref())
            .filter(|c| c.epoch == slot.epoch)
        {
            Some(channel) => {
                channel.apply_quota(result::quota_headers(response, SystemTime::now()), now);
            }
            None => debug!(channel = ?slot.channel, "Channel removed, discarding quota update"),
        }
    }

    fn mark_exhausted(&self, slot: &Slot) {
        self.metrics.record_upstream_rate_limited();
        let mut state = self.state.lock();
        if let Some(channel) = state
            .registry
            .get_mut(slot.channel.as_deref())
            .filter(|c| c.epoch == slot.epoch)
        {
            channel.force_exhausted();
        }
    }

    /// Wait until `job` is at the head of its queue and its channel and the
    /// global cap both allow a dispatch, then pop it.
    async fn wait_for_turn(&self, job: &Job) -> Result<Slot> {
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let now = Instant::now();
                let mut guard = self.state.lock();
                let state = &mut *guard;
                self.catch_up(state, now);

                if let Some(err) = state.evicted.remove(&job.id) {
                    return Err(err);
                }
                let key = state.registry.locate(job.id).ok_or(FetchError::Cancelled)?;
                let concurrency = state.throttle.concurrency_available();
                let channel = state
                    .registry
                    .get_mut(key.as_deref())
                    .ok_or(FetchError::Cancelled)?;

                if concurrency && channel.has_capacity() && channel.is_head(job.id) {
                    let request = channel.remove(job.id).ok_or(FetchError::Cancelled)?;
                    state.throttle.dequeued();
                    let slot = state.occupy(key.clone()).ok_or(FetchError::Cancelled)?;
                    state.ongoing.insert(
                        request.fingerprint,
                        Ongoing {
                            id: job.id,
                            handle: request.handle,
                        },
                    );
                    debug!(
                        fingerprint = %job.fingerprint,
                        channel = ?key,
                        waited_ms = now.duration_since(request.enqueued_at).as_millis(),
                        "Dispatching queued request"
                    );
                    self.publish_load(state);
                    self.capacity.notify_waiters();
                    return Ok(slot);
                }

                if channel.remaining == 0 {
                    channel.time_until_reset(now).max(POLL_INTERVAL)
                } else {
                    POLL_INTERVAL
                }
            };

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Re-acquire a slot after an upstream rate limit, without queueing.
    ///
    /// Stays on the same channel unless it was removed in the meantime, in
    /// which case selection runs again.
    async fn wait_for_reset(&self, job: &Job, previous: &Slot) -> Result<Slot> {
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let now = Instant::now();
                let mut guard = self.state.lock();
                let state = &mut *guard;
                self.catch_up(state, now);

                let still_there = state
                    .registry
                    .get(previous.channel.as_deref())
                    .is_some_and(|c| c.epoch == previous.epoch);
                let key = if still_there {
                    previous.channel.clone()
                } else {
                    state.registry.select(job.options.credential.as_deref())?
                };

                let concurrency = state.throttle.concurrency_available();
                let channel = state
                    .registry
                    .get(key.as_deref())
                    .ok_or(FetchError::Cancelled)?;
                if concurrency && channel.has_capacity() {
                    let slot = state.occupy(key).ok_or(FetchError::Cancelled)?;
                    self.publish_load(state);
                    return Ok(slot);
                }

                if channel.remaining == 0 {
                    channel.time_until_reset(now).max(POLL_INTERVAL)
                } else {
                    POLL_INTERVAL
                }
            };

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Restore expired channel quotas; a reset also sweeps the cache
    fn catch_up(&self, state: &mut State, now: Instant) {
        if state.registry.catch_up_all(now) {
            let swept = self.cache.sweep_expired(now.into_std());
            info!(swept, "Channel quota reset");
            self.capacity.notify_waiters();
        }
    }

    fn publish_load(&self, state: &State) {
        debug_assert_eq!(state.throttle.total_queued, state.registry.total_queued());
        self.metrics
            .set_load(state.throttle.total_ongoing, state.throttle.total_queued);
    }

    fn resolve_url(&self, path: &str) -> Result<String> {
        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            let base = self.config.base_url.trim_end_matches('/');
            if path.starts_with('/') {
                format!("{base}{path}")
            } else {
                format!("{base}/{path}")
            }
        };
        url::Url::parse(&url)?;
        Ok(url)
    }

    /// Replace the credential set.
    ///
    /// Surviving channels keep their quota state. Queued requests of removed
    /// channels fail with `UnknownCredential` when pinned and otherwise move to
    /// whichever channel selection now picks.
    pub fn set_credentials(&self, credentials: &[CredentialConfig]) -> Result<()> {
        validate_credentials(credentials)?;

        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let orphans = state.registry.reconfigure(credentials, now);

        let mut failed = 0usize;
        let mut migrated = 0usize;
        for request in orphans {
            if let Some(id) = &request.pinned {
                state
                    .evicted
                    .insert(request.id, FetchError::UnknownCredential(id.clone()));
                state.throttle.dequeued();
                failed += 1;
                continue;
            }

            let target = state.registry.select(None)?;
            if let Some(channel) = state.registry.get_mut(target.as_deref()) {
                channel.enqueue(request);
                migrated += 1;
            }
        }

        info!(
            credentials = credentials.len(),
            migrated, failed, "Reconfigured credentials"
        );
        self.publish_load(state);
        self.capacity.notify_waiters();
        Ok(())
    }

    /// Read-only view; no catch-up reset is performed
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let now = Instant::now();
        let state = self.state.lock();

        let channels = state
            .registry
            .iter()
            .map(|c| ChannelSnapshot {
                credential: c.credential.clone(),
                limit: c.limit,
                remaining: c.remaining,
                reset_in: c.reset_at.saturating_duration_since(now),
                queued_count: c.queued_len(),
                priority_queued_count: c.priority_queue.len(),
                ongoing: c.ongoing,
            })
            .collect();

        SchedulerSnapshot {
            channels,
            total_ongoing: state.throttle.total_ongoing,
            total_queued: state.throttle.total_queued,
            cached_entries: self.cache.len(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// Returns a request's slot and ongoing-table entry exactly once, also when
/// the task is cancelled mid-flight
struct DispatchGuard<'a> {
    scheduler: &'a Scheduler,
    id: u64,
    fingerprint: &'a str,
    slot: Option<Slot>,
    settled: bool,
}

impl DispatchGuard<'_> {
    fn release_slot(&mut self) {
        if let Some(slot) = self.slot.take() {
            let mut state = self.scheduler.state.lock();
            state.release(&slot);
            self.scheduler.publish_load(&state);
            self.scheduler.capacity.notify_waiters();
        }
    }

    /// Write the cache entry (if any), then release the slot and the
    /// ongoing-table entry in the same critical section
    fn settle(&mut self, cache_write: Option<(&Arc<RawResult>, Duration)>) {
        if self.settled {
            return;
        }
        self.settled = true;

        let mut guard = self.scheduler.state.lock();
        let state = &mut *guard;

        if let Some((result, ttl)) = cache_write.filter(|(_, ttl)| !ttl.is_zero()) {
            let now = Instant::now().into_std();
            let data_timestamp = now.checked_sub(result.data_age()).unwrap_or(now);
            self.scheduler
                .cache
                .insert(self.fingerprint, data_timestamp, ttl, Arc::clone(result));
        }

        if let Some(slot) = self.slot.take() {
            state.release(&slot);
        }
        if state
            .ongoing
            .get(self.fingerprint)
            .is_some_and(|o| o.id == self.id)
        {
            state.ongoing.remove(self.fingerprint);
        }

        self.scheduler.publish_load(state);
        self.scheduler.capacity.notify_waiters();
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.settle(None);
    }
}
