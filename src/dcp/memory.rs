//! Bucket memory accounting read by the replication throttle.
//!
//! A single estimated counter: the storage path charges and releases it,
//! every passive stream reads it with relaxed ordering. Readers tolerate a
//! slightly stale value; the throttle is a heuristic, not a hard quota.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct MemoryTracker {
    mem_used: AtomicUsize,
    max_size: AtomicUsize,
}

impl MemoryTracker {
    /// `max_size == 0` disables the throttle.
    pub fn new(max_size: usize) -> Self {
        Self {
            mem_used: AtomicUsize::new(0),
            max_size: AtomicUsize::new(max_size),
        }
    }

    pub fn mem_used(&self) -> usize {
        self.mem_used.load(Ordering::Relaxed)
    }

    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    pub fn set_max_size(&self, bytes: usize) {
        self.max_size.store(bytes, Ordering::Relaxed);
    }

    pub fn charge(&self, bytes: usize) {
        self.mem_used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: usize) {
        let _ = self
            .mem_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Usage above which replicas stop applying and start buffering.
    pub fn threshold(&self, throttle_percent: u8) -> usize {
        self.max_size() / 100 * throttle_percent as usize
            + self.max_size() % 100 * throttle_percent as usize / 100
    }

    /// Whether applying `incoming` more bytes would cross the threshold.
    pub fn over_threshold(&self, incoming: usize, throttle_percent: u8) -> bool {
        if self.max_size() == 0 {
            return false;
        }
        self.mem_used().saturating_add(incoming) > self.threshold(throttle_percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_includes_incoming_bytes() {
        let tracker = MemoryTracker::new(1_000);
        tracker.charge(900);
        assert!(!tracker.over_threshold(30, 93));
        assert!(tracker.over_threshold(31, 93));
    }

    #[test]
    fn release_saturates_at_zero() {
        let tracker = MemoryTracker::new(100);
        tracker.charge(10);
        tracker.release(50);
        assert_eq!(tracker.mem_used(), 0);
    }

    #[test]
    fn zero_max_size_never_throttles() {
        let tracker = MemoryTracker::new(0);
        tracker.charge(usize::MAX / 2);
        assert!(!tracker.over_threshold(1, 1));
    }
}
