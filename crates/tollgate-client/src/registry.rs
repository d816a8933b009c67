//! The set of rate-limit channels and the rules for picking one

use tokio::time::Instant;

use crate::channel::{QueueKind, QueuedRequest, RateLimitChannel};
use crate::config::{ChannelLimits, CredentialConfig};
use crate::error::{FetchError, Result};
use crate::scheduler::SharedFetch;

/// Identifies a channel: the credential id, or `None` for the shared channel
pub type ChannelKey = Option<String>;

/// A queued request found by fingerprint
pub struct QueuedMatch {
    pub channel: ChannelKey,
    pub id: u64,
    pub kind: QueueKind,
    pub handle: SharedFetch,
}

#[derive(Debug)]
pub struct ChannelRegistry {
    default: RateLimitChannel,
    /// Credential channels in configuration order
    keyed: Vec<RateLimitChannel>,
    next_epoch: u64,
}

impl ChannelRegistry {
    pub fn new(default_limits: ChannelLimits, credentials: &[CredentialConfig], now: Instant) -> Self {
        let mut registry = Self {
            default: RateLimitChannel::new(None, default_limits, 0, now),
            keyed: Vec::with_capacity(credentials.len()),
            next_epoch: 1,
        };
        for credential in credentials {
            let channel = registry.fresh_channel(credential, now);
            registry.keyed.push(channel);
        }
        registry
    }

    fn fresh_channel(&mut self, credential: &CredentialConfig, now: Instant) -> RateLimitChannel {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        RateLimitChannel::new(Some(credential.id.clone()), credential.limits(), epoch, now)
    }

    pub fn has_credentials(&self) -> bool {
        !self.keyed.is_empty()
    }

    pub fn get(&self, key: Option<&str>) -> Option<&RateLimitChannel> {
        match key {
            None => Some(&self.default),
            Some(id) => self.keyed.iter().find(|c| c.credential.as_deref() == Some(id)),
        }
    }

    pub fn get_mut(&mut self, key: Option<&str>) -> Option<&mut RateLimitChannel> {
        match key {
            None => Some(&mut self.default),
            Some(id) => self
                .keyed
                .iter_mut()
                .find(|c| c.credential.as_deref() == Some(id)),
        }
    }

    /// Shared channel first, then credential channels in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &RateLimitChannel> {
        std::iter::once(&self.default).chain(self.keyed.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RateLimitChannel> {
        std::iter::once(&mut self.default).chain(self.keyed.iter_mut())
    }

    /// Pick the channel a new request goes to.
    ///
    /// A pinned credential must exist. Without credentials everything shares the
    /// default channel; otherwise the channel with the most effective quota wins,
    /// the earliest configured one on ties.
    pub fn select(&self, pinned: Option<&str>) -> Result<ChannelKey> {
        if let Some(id) = pinned {
            return self
                .get(Some(id))
                .map(|c| c.credential.clone())
                .ok_or_else(|| FetchError::UnknownCredential(id.to_string()));
        }

        if !self.has_credentials() {
            return Ok(None);
        }

        let mut best: Option<&RateLimitChannel> = None;
        for channel in &self.keyed {
            if best.is_none_or(|b| channel.effective_remaining() > b.effective_remaining()) {
                best = Some(channel);
            }
        }
        Ok(best.and_then(|c| c.credential.clone()))
    }

    /// Run a catch-up reset on every channel; `true` if any quota was restored
    pub fn catch_up_all(&mut self, now: Instant) -> bool {
        self.iter_mut()
            .fold(false, |reset, channel| channel.catch_up_reset(now) || reset)
    }

    pub fn find_queued(&self, fingerprint: &str) -> Option<QueuedMatch> {
        self.iter().find_map(|channel| {
            channel
                .find_fingerprint(fingerprint)
                .map(|(request, kind)| QueuedMatch {
                    channel: channel.credential.clone(),
                    id: request.id,
                    kind,
                    handle: request.handle.clone(),
                })
        })
    }

    /// Channel currently holding the queued request `id`
    pub fn locate(&self, id: u64) -> Option<ChannelKey> {
        self.iter()
            .find(|channel| channel.locate(id).is_some())
            .map(|channel| channel.credential.clone())
    }

    pub fn total_queued(&self) -> usize {
        self.iter().map(RateLimitChannel::queued_len).sum()
    }

    /// Replace the credential channels.
    ///
    /// Channels whose credential survives keep their quota state and queues.
    /// Removed channels are dropped and their queued requests handed back,
    /// priority requests first, for the caller to fail or migrate.
    pub fn reconfigure(&mut self, credentials: &[CredentialConfig], now: Instant) -> Vec<QueuedRequest> {
        let mut previous = std::mem::take(&mut self.keyed);
        let mut keyed = Vec::with_capacity(credentials.len());

        for credential in credentials {
            let existing = previous
                .iter()
                .position(|c| c.credential.as_deref() == Some(credential.id.as_str()))
                .map(|pos| previous.remove(pos));

            let channel = match existing {
                Some(mut channel) => {
                    let limits = credential.limits();
                    channel.limit = limits.limit;
                    channel.interval = limits.interval;
                    channel.remaining = channel.remaining.min(limits.limit);
                    channel
                }
                None => self.fresh_channel(credential, now),
            };
            keyed.push(channel);
        }
        self.keyed = keyed;

        previous
            .iter_mut()
            .flat_map(RateLimitChannel::drain_queues)
            .collect()
    }
}
