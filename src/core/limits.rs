//! Replication limits and timing knobs (normative defaults).

use serde::{Deserialize, Serialize};

/// Numeric knobs consumed read-only by connections and streams.
///
/// Values are explicit about their units to avoid confusion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub noop_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub connection_manager_interval_ms: u64,

    /// Percent of bucket max size above which replicas buffer instead of apply.
    pub replication_throttle_percent: u8,

    pub flow_control_window_bytes: usize,
    pub buffer_ack_threshold_percent: u8,
    pub buffer_ack_interval_ms: u64,

    pub processor_batch_bytes: usize,
    pub processor_backoff_ms: u64,
    pub checkpoint_processor_vbuckets_per_run: usize,
    pub backfill_batch_items: usize,

    pub ready_queue_max_bytes: usize,
    pub passive_buffer_max_items: usize,
    pub passive_buffer_max_bytes: usize,

    pub failover_log_max_entries: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            noop_interval_ms: 20_000,
            idle_timeout_ms: 360_000,
            connection_manager_interval_ms: 2_000,

            replication_throttle_percent: 93,

            flow_control_window_bytes: 10 * 1024 * 1024,
            buffer_ack_threshold_percent: 20,
            buffer_ack_interval_ms: 5_000,

            processor_batch_bytes: 4 * 1024,
            processor_backoff_ms: 100,
            checkpoint_processor_vbuckets_per_run: 4,
            backfill_batch_items: 256,

            ready_queue_max_bytes: 4 * 1024 * 1024,
            passive_buffer_max_items: 100_000,
            passive_buffer_max_bytes: 64 * 1024 * 1024,

            failover_log_max_entries: 25,
        }
    }
}

impl Limits {
    /// Freed bytes at which a consumer acknowledges its flow-control window.
    pub fn buffer_ack_threshold_bytes(&self, window_bytes: usize) -> usize {
        window_bytes * self.buffer_ack_threshold_percent as usize / 100
    }
}
