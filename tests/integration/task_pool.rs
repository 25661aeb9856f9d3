//! Background work driven by a real task pool instead of inline calls.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dcp_rs::config::Config;
use dcp_rs::dcp::message::{marker_flags, open_flags};
use dcp_rs::dcp::{
    DcpEngine, EngineContext, MemoryBucket, MemoryTracker, PeerResponse, RecordingSink,
    StreamReqReply, Stores, TaskPool,
};
use dcp_rs::{Cookie, Item, Status, VBucketState};

use crate::fixtures::{VB, request};

fn wait_for(mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    pred()
}

fn engine_with_pool(
    state: VBucketState,
    max_memory: usize,
    pool: &TaskPool,
) -> (DcpEngine, Arc<MemoryBucket>, Arc<MemoryTracker>) {
    let config = Config::default();
    let memory = Arc::new(MemoryTracker::new(max_memory));
    let bucket = Arc::new(MemoryBucket::new(Arc::clone(&memory), &config.limits));
    bucket.create_vbucket(VB, state);
    let ctx = EngineContext::new(&config, Stores::in_memory(Arc::clone(&bucket)))
        .with_task_pool(pool.clone());
    (DcpEngine::new(Arc::new(ctx)), bucket, memory)
}

#[test]
fn pool_runs_backfill_and_checkpoint_processing() {
    let pool = TaskPool::start(2).expect("pool");
    let (engine, bucket, _) = engine_with_pool(VBucketState::Active, 0, &pool);
    for key in ["a", "b", "c"] {
        bucket.queue_mutation(VB, key, "v").expect("queue");
    }
    bucket.create_new_checkpoint(VB).expect("checkpoint");
    bucket.persist(VB).expect("persist");
    bucket.remove_closed_checkpoints(VB).expect("evict");
    bucket.queue_mutation(VB, "d", "v").expect("queue");

    let cookie = Cookie::new(1);
    assert_eq!(
        engine.open(cookie, 0, "pooled", open_flags::PRODUCER),
        Status::Success
    );
    assert!(matches!(
        engine.stream_req(cookie, request(1, 0, u64::MAX)),
        StreamReqReply::Accepted(_)
    ));

    let mut sink = RecordingSink::new();
    let delivered = wait_for(|| {
        while engine.step(cookie, &mut sink) == Status::Success {}
        sink.seqnos().len() >= 4
    });
    assert!(delivered, "got {:?}", sink.seqnos());
    assert_eq!(sink.seqnos(), vec![1, 2, 3, 4]);

    engine.disconnect(cookie);
    pool.shutdown();
}

#[test]
fn pool_drains_buffered_messages_once_memory_frees() {
    let pool = TaskPool::start(1).expect("pool");
    let (engine, bucket, memory) = engine_with_pool(VBucketState::Replica, 1_000, &pool);
    memory.charge(950);

    let cookie = Cookie::new(2);
    assert_eq!(engine.open(cookie, 0, "pooled", 0), Status::Success);
    assert_eq!(engine.add_stream(cookie, 1, VB, 0), Status::Success);
    let consumer = engine
        .conn_map()
        .find_by_cookie(cookie)
        .and_then(|conn| conn.as_consumer().cloned())
        .expect("consumer");
    let opaque = consumer.stream(VB).expect("stream").opaque();
    let accept = PeerResponse::StreamRequest {
        opaque,
        status: Status::Success,
        failover_log: Vec::new(),
        rollback_seqno: 0,
    };
    assert_eq!(engine.response_handler(cookie, &accept), Status::Success);

    assert_eq!(
        engine.snapshot_marker(cookie, opaque, VB, 1, 2, marker_flags::MEMORY),
        Status::TempFail
    );
    for seqno in 1..=2 {
        let item = Item::mutation(VB, format!("k{seqno}"), "v", seqno);
        assert_eq!(engine.mutation(cookie, opaque, item), Status::TempFail);
    }
    assert!(wait_for(|| consumer.backoffs() >= 1));
    assert!(bucket.applied_seqnos(VB).is_empty());

    memory.release(950);
    assert!(wait_for(|| bucket.applied_seqnos(VB) == vec![1, 2]));
    assert!(wait_for(|| consumer.stats().buffered_messages == 0));

    drop(consumer);
    engine.disconnect(cookie);
    pool.shutdown();
}
