#![allow(dead_code)]

pub mod pipe;

use std::sync::Arc;

use dcp_rs::clock::ManualClock;
use dcp_rs::config::Config;
use dcp_rs::dcp::message::open_flags;
use dcp_rs::dcp::{
    DcpConsumer, DcpEngine, DcpProducer, EngineContext, MemoryBucket, MemoryTracker,
    RecordingNotifier, StreamRequest, Stores,
};
use dcp_rs::{Cookie, VBucketState, Vbid};

pub const VB: Vbid = Vbid::new(0);
pub const START_MS: u64 = 1_000_000;

/// One bucket with its engine, driven by a manual clock.
pub struct Node {
    pub bucket: Arc<MemoryBucket>,
    pub memory: Arc<MemoryTracker>,
    pub engine: DcpEngine,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Node {
    pub fn new(state: VBucketState, config: Config) -> Self {
        Self::with_memory(state, config, 0)
    }

    /// `max_memory == 0` leaves the replication throttle off.
    pub fn with_memory(state: VBucketState, config: Config, max_memory: usize) -> Self {
        let memory = Arc::new(MemoryTracker::new(max_memory));
        let bucket = Arc::new(MemoryBucket::new(Arc::clone(&memory), &config.limits));
        bucket.create_vbucket(VB, state);
        let clock = Arc::new(ManualClock::new(START_MS));
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = EngineContext::new(&config, Stores::in_memory(Arc::clone(&bucket)))
            .with_clock(clock.clone())
            .with_notifier(notifier.clone());
        Self {
            bucket,
            memory,
            engine: DcpEngine::new(Arc::new(ctx)),
            clock,
            notifier,
        }
    }

    pub fn active() -> Self {
        Self::new(VBucketState::Active, Config::default())
    }

    pub fn replica() -> Self {
        Self::new(VBucketState::Replica, Config::default())
    }

    pub fn open_producer(&self, cookie: Cookie, name: &str) -> Arc<DcpProducer> {
        assert_eq!(
            self.engine.open(cookie, 0, name, open_flags::PRODUCER),
            dcp_rs::Status::Success
        );
        self.producer(cookie)
    }

    pub fn open_consumer(&self, cookie: Cookie, name: &str) -> Arc<DcpConsumer> {
        assert_eq!(self.engine.open(cookie, 0, name, 0), dcp_rs::Status::Success);
        self.consumer(cookie)
    }

    pub fn producer(&self, cookie: Cookie) -> Arc<DcpProducer> {
        self.engine
            .conn_map()
            .find_by_cookie(cookie)
            .and_then(|conn| conn.as_producer().cloned())
            .expect("producer registered")
    }

    pub fn consumer(&self, cookie: Cookie) -> Arc<DcpConsumer> {
        self.engine
            .conn_map()
            .find_by_cookie(cookie)
            .and_then(|conn| conn.as_consumer().cloned())
            .expect("consumer registered")
    }

    /// Queue `count` mutations and tell the directory about them.
    pub fn write(&self, count: usize) -> u64 {
        let mut last = 0;
        for i in 0..count {
            last = self
                .bucket
                .queue_mutation(VB, format!("key-{i}"), format!("value-{i}"))
                .expect("queue mutation");
        }
        self.engine.conn_map().notify_vb_connections(VB, last);
        last
    }
}

pub fn request(opaque: u32, start: u64, end: u64) -> StreamRequest {
    StreamRequest {
        flags: 0,
        opaque,
        vbid: VB,
        start_seqno: start,
        end_seqno: end,
        vb_uuid: 0,
        snap_start: start,
        snap_end: start,
    }
}
