//! Everything a connection needs from its bucket, passed explicitly.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ReplicationConfig};
use crate::core::Limits;
use crate::telemetry::BucketContext;

use super::memory::MemoryTracker;
use super::memory_bucket::MemoryBucket;
use super::notify::{IoNotifier, PendingNotifications, TracingNotifier};
use super::store::{CheckpointLog, FailoverLog, VBucketStore};
use super::task::TaskPool;

/// The storage collaborators of one bucket.
#[derive(Clone)]
pub struct Stores {
    pub vbuckets: Arc<dyn VBucketStore>,
    pub checkpoints: Arc<dyn CheckpointLog>,
    pub failover: Arc<dyn FailoverLog>,
    pub memory: Arc<MemoryTracker>,
}

impl Stores {
    /// All three collaborators backed by one [`MemoryBucket`].
    pub fn in_memory(bucket: Arc<MemoryBucket>) -> Self {
        Self {
            vbuckets: bucket.clone(),
            checkpoints: bucket.clone(),
            failover: bucket.clone(),
            memory: bucket.memory(),
        }
    }
}

pub struct EngineContext {
    pub bucket: BucketContext,
    pub limits: Limits,
    pub replication: ReplicationConfig,
    pub stores: Stores,
    pub clock: Arc<dyn Clock>,
    /// Background pool. Without one, producers and consumers only make
    /// background progress when the host drives them.
    pub tasks: Option<TaskPool>,
    pub notifier: Arc<dyn IoNotifier>,
    pub pending: Arc<PendingNotifications>,
}

impl EngineContext {
    pub fn new(config: &Config, stores: Stores) -> Self {
        let bucket_name = if config.replication.bucket_name.is_empty() {
            "default"
        } else {
            config.replication.bucket_name.as_str()
        };
        Self {
            bucket: BucketContext::new(bucket_name),
            limits: config.limits.clone(),
            replication: config.replication.clone(),
            stores,
            clock: Arc::new(SystemClock),
            tasks: None,
            notifier: Arc::new(TracingNotifier),
            pending: Arc::new(PendingNotifications::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_task_pool(mut self, pool: TaskPool) -> Self {
        self.tasks = Some(pool);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn IoNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn vbuckets(&self) -> &dyn VBucketStore {
        self.stores.vbuckets.as_ref()
    }

    pub fn failover(&self) -> &dyn FailoverLog {
        self.stores.failover.as_ref()
    }

    pub fn memory(&self) -> &MemoryTracker {
        &self.stores.memory
    }

    /// Incoming bytes would push the bucket past the replication threshold.
    pub fn over_replication_threshold(&self, incoming: usize) -> bool {
        self.stores
            .memory
            .over_threshold(incoming, self.limits.replication_throttle_percent)
    }
}
