//! Rate-limit channels: one quota bucket per credential plus a shared default
//!
//! A channel tracks the quota left in the current interval, the number of its
//! requests currently on the wire, and two FIFO queues. The priority queue is
//! always drained before the normal queue.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ChannelLimits;
use crate::scheduler::SharedFetch;

/// Slack after `reset_at` before the local quota is restored
pub const RESET_GRACE: Duration = Duration::from_secs(1);

/// Which of a channel's two queues a request sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Priority,
    Normal,
}

/// A request waiting for its turn on a channel
#[derive(Clone)]
pub struct QueuedRequest {
    /// Monotonically increasing identity; queues are searched by it, never by position
    pub id: u64,
    pub fingerprint: String,
    pub enqueued_at: Instant,
    pub is_priority: bool,
    /// Credential the caller pinned, if any
    pub pinned: Option<String>,
    /// Outcome shared with every caller that joined this request
    pub handle: SharedFetch,
}

impl std::fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .field("enqueued_at", &self.enqueued_at)
            .field("is_priority", &self.is_priority)
            .field("pinned", &self.pinned)
            .finish_non_exhaustive()
    }
}

/// Server-declared quota information from one response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaHeaders {
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
    pub reset_in: Option<Duration>,
}

#[derive(Debug)]
pub struct RateLimitChannel {
    /// `None` for the shared channel
    pub credential: Option<String>,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Instant,
    pub interval: Duration,
    /// Requests of this channel currently executing
    pub ongoing: u32,
    /// Distinguishes this record from a later channel with the same credential
    pub epoch: u64,
    pub priority_queue: VecDeque<QueuedRequest>,
    pub normal_queue: VecDeque<QueuedRequest>,
}

impl RateLimitChannel {
    pub fn new(credential: Option<String>, limits: ChannelLimits, epoch: u64, now: Instant) -> Self {
        Self {
            credential,
            limit: limits.limit,
            remaining: limits.limit,
            reset_at: deadline(now, limits.interval),
            interval: limits.interval,
            ongoing: 0,
            epoch,
            priority_queue: VecDeque::new(),
            normal_queue: VecDeque::new(),
        }
    }

    /// Quota not yet claimed by in-flight requests; may be negative transiently
    pub fn effective_remaining(&self) -> i64 {
        i64::from(self.remaining) - i64::from(self.ongoing)
    }

    pub fn has_capacity(&self) -> bool {
        self.effective_remaining() > 0
    }

    /// Restore the quota once `now` is past `reset_at` by more than the grace window.
    ///
    /// Returns `true` when a reset happened.
    pub fn catch_up_reset(&mut self, now: Instant) -> bool {
        if now <= deadline(self.reset_at, RESET_GRACE) {
            return false;
        }

        self.remaining = self.limit;
        let next = deadline(self.reset_at, self.interval);
        // After a long idle period a single step would leave the boundary in the
        // past and the next admission would reset again.
        self.reset_at = if next <= now {
            deadline(now, self.interval)
        } else {
            next
        };
        true
    }

    /// Fold a response's quota headers into the tracked state.
    ///
    /// `remaining` only ever moves down here; `reset_at` follows the server only
    /// when `remaining` actually changed, and never lies more than one interval
    /// ahead. A response without a remaining header is debited locally.
    /// Returns `true` if `remaining` changed.
    pub fn apply_quota(&mut self, headers: QuotaHeaders, now: Instant) -> bool {
        if let Some(limit) = headers.limit.filter(|l| *l > 0) {
            self.limit = limit;
        }

        let updated = match headers.remaining {
            Some(server) => self.remaining.min(server),
            None => self.remaining.saturating_sub(1),
        };
        if updated == self.remaining {
            return false;
        }

        self.remaining = updated;
        if let Some(reset_in) = headers.reset_in {
            self.reset_at = deadline(now, reset_in.min(self.interval));
        }
        true
    }

    /// The upstream said the quota is gone regardless of what we tracked
    pub fn force_exhausted(&mut self) {
        self.remaining = 0;
    }

    /// Time until the quota will be restored by a catch-up reset
    pub fn time_until_reset(&self, now: Instant) -> Duration {
        deadline(self.reset_at, RESET_GRACE).saturating_duration_since(now)
    }

    pub fn enqueue(&mut self, request: QueuedRequest) {
        if request.is_priority {
            self.priority_queue.push_back(request);
        } else {
            self.normal_queue.push_back(request);
        }
    }

    pub fn locate(&self, id: u64) -> Option<QueueKind> {
        if self.priority_queue.iter().any(|r| r.id == id) {
            Some(QueueKind::Priority)
        } else if self.normal_queue.iter().any(|r| r.id == id) {
            Some(QueueKind::Normal)
        } else {
            None
        }
    }

    pub fn find_fingerprint(&self, fingerprint: &str) -> Option<(&QueuedRequest, QueueKind)> {
        self.priority_queue
            .iter()
            .find(|r| r.fingerprint == fingerprint)
            .map(|r| (r, QueueKind::Priority))
            .or_else(|| {
                self.normal_queue
                    .iter()
                    .find(|r| r.fingerprint == fingerprint)
                    .map(|r| (r, QueueKind::Normal))
            })
    }

    /// Move a normal-queue request to the tail of the priority queue.
    pub fn escalate(&mut self, id: u64) -> bool {
        let Some(pos) = self.normal_queue.iter().position(|r| r.id == id) else {
            return false;
        };
        let Some(mut request) = self.normal_queue.remove(pos) else {
            return false;
        };
        request.is_priority = true;
        self.priority_queue.push_back(request);
        true
    }

    /// `true` if `id` is the next request this channel would dispatch
    pub fn is_head(&self, id: u64) -> bool {
        match self.priority_queue.front() {
            Some(head) => head.id == id,
            None => self.normal_queue.front().is_some_and(|head| head.id == id),
        }
    }

    /// Whether a new request of the given priority would overtake someone waiting
    pub fn has_waiting_ahead_of(&self, is_priority: bool) -> bool {
        !self.priority_queue.is_empty() || (!is_priority && !self.normal_queue.is_empty())
    }

    pub fn remove(&mut self, id: u64) -> Option<QueuedRequest> {
        if let Some(pos) = self.priority_queue.iter().position(|r| r.id == id) {
            return self.priority_queue.remove(pos);
        }
        let pos = self.normal_queue.iter().position(|r| r.id == id)?;
        self.normal_queue.remove(pos)
    }

    /// Empty both queues, priority requests first
    pub fn drain_queues(&mut self) -> Vec<QueuedRequest> {
        self.priority_queue
            .drain(..)
            .chain(self.normal_queue.drain(..))
            .collect()
    }

    pub fn queued_len(&self) -> usize {
        self.priority_queue.len() + self.normal_queue.len()
    }
}

/// `from + after`, pinned to `from` when the sum is not representable
fn deadline(from: Instant, after: Duration) -> Instant {
    from.checked_add(after).unwrap_or(from)
}
