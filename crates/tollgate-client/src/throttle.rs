//! Process-wide counters shared by every channel

/// Hard ceiling on concurrently executing requests across all channels
pub const GLOBAL_CONCURRENCY_CAP: usize = 50;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GlobalThrottle {
    pub total_ongoing: usize,
    pub total_queued: usize,
}

impl GlobalThrottle {
    /// New work may start unless more than the cap is already executing
    pub fn concurrency_available(&self) -> bool {
        self.total_ongoing <= GLOBAL_CONCURRENCY_CAP
    }

    pub fn queue_full(&self, max_queue_length: usize) -> bool {
        self.total_queued >= max_queue_length
    }

    pub fn begin_dispatch(&mut self) {
        self.total_ongoing += 1;
    }

    pub fn end_dispatch(&mut self) {
        self.total_ongoing = self.total_ongoing.saturating_sub(1);
    }

    pub fn enqueued(&mut self) {
        self.total_queued += 1;
    }

    pub fn dequeued(&mut self) {
        self.total_queued = self.total_queued.saturating_sub(1);
    }
}
