//! Point-in-time view of the scheduler

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    /// `None` for the shared channel
    pub credential: Option<String>,
    pub limit: u32,
    pub remaining: u32,
    pub reset_in: Duration,
    /// Requests waiting in either queue
    pub queued_count: usize,
    /// The part of `queued_count` sitting in the priority queue
    pub priority_queued_count: usize,
    pub ongoing: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    /// Shared channel first, then credential channels in configuration order
    pub channels: Vec<ChannelSnapshot>,
    pub total_ongoing: usize,
    pub total_queued: usize,
    pub cached_entries: usize,
}

impl SchedulerSnapshot {
    pub fn channel(&self, credential: Option<&str>) -> Option<&ChannelSnapshot> {
        self.channels
            .iter()
            .find(|c| c.credential.as_deref() == credential)
    }
}
