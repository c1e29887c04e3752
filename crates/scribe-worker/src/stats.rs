//! Worker pool counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks accepted into the queue
    pub submitted: u64,
    /// Tasks rejected because the queue was full or the pool was closing
    pub dropped: u64,
    /// Tasks that returned `Ok`
    pub completed: u64,
    /// Tasks that returned an error or panicked
    pub failed: u64,
    /// Tasks cancelled by their timeout
    pub timed_out: u64,
    /// Tasks waiting in the queue
    pub queued: u64,
    /// Tasks currently running
    pub in_flight: u64,
}

impl PoolStats {
    /// Tasks that ran to an end, whatever the outcome
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.timed_out
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub dropped: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub queued: AtomicU64,
    pub in_flight: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drop_one(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}
