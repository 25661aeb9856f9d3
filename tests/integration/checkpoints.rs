//! How incoming snapshots shape the replica's checkpoints.

use dcp_rs::config::Config;
use dcp_rs::dcp::message::marker_flags;
use dcp_rs::dcp::{PeerResponse, StreamReqReply, VBucketStore};
use dcp_rs::{Cookie, FailoverEntry, Item, Status, VBucketState};

use crate::fixtures::{Node, VB, request};

const CONSUMER: Cookie = Cookie::new(5);

/// Open a consumer with an accepted stream; returns the stream opaque.
fn accepted_stream(node: &Node) -> u32 {
    let consumer = node.open_consumer(CONSUMER, "checkpoints");
    assert_eq!(node.engine.add_stream(CONSUMER, 9, VB, 0), Status::Success);
    let opaque = consumer.stream(VB).expect("stream").opaque();
    let accept = PeerResponse::StreamRequest {
        opaque,
        status: Status::Success,
        failover_log: vec![FailoverEntry {
            vb_uuid: 0xfeed,
            by_seqno: 0,
        }],
        rollback_seqno: 0,
    };
    assert_eq!(
        node.engine.response_handler(CONSUMER, &accept),
        Status::Success
    );
    opaque
}

fn open_checkpoint(node: &Node) -> u64 {
    node.bucket.info(VB).expect("vbucket").open_checkpoint_id
}

#[test]
fn disk_snapshot_then_memory_snapshot_renumbers_checkpoints() {
    let mut config = Config::default();
    config.replication.disk_backfill_queue = true;
    let node = Node::new(VBucketState::Replica, config);
    let opaque = accepted_stream(&node);
    let engine = &node.engine;

    assert_eq!(
        engine.snapshot_marker(CONSUMER, opaque, VB, 1, 2, marker_flags::DISK),
        Status::Success
    );
    assert_eq!(open_checkpoint(&node), 0);
    assert!(node.bucket.info(VB).expect("vbucket").backfill_phase);
    for seqno in 1..=2 {
        let item = Item::mutation(VB, format!("k{seqno}"), "v", seqno);
        assert_eq!(engine.mutation(CONSUMER, opaque, item), Status::Success);
    }

    assert_eq!(
        engine.snapshot_marker(CONSUMER, opaque, VB, 3, 3, marker_flags::MEMORY),
        Status::Success
    );
    assert_eq!(open_checkpoint(&node), 1);
    assert!(!node.bucket.info(VB).expect("vbucket").backfill_phase);

    assert_eq!(
        engine.set_vbucket_state(CONSUMER, opaque, VB, VBucketState::Replica),
        Status::Success
    );
    assert_eq!(open_checkpoint(&node), 2);
}

#[test]
fn initial_disk_snapshot_blocks_stream_requests_until_complete() {
    let node = Node::replica();
    let opaque = accepted_stream(&node);
    let producer = Cookie::new(6);
    node.open_producer(producer, "downstream");
    let engine = &node.engine;

    assert_eq!(
        engine.snapshot_marker(CONSUMER, opaque, VB, 1, 2, marker_flags::DISK),
        Status::Success
    );
    assert!(
        node.bucket
            .info(VB)
            .expect("vbucket")
            .receiving_initial_disk_snapshot
    );
    assert_eq!(
        engine.stream_req(producer, request(1, 0, u64::MAX)),
        StreamReqReply::Rejected(Status::TempFail)
    );

    for seqno in 1..=2 {
        let item = Item::mutation(VB, format!("k{seqno}"), "v", seqno);
        assert_eq!(engine.mutation(CONSUMER, opaque, item), Status::Success);
    }
    assert!(
        !node
            .bucket
            .info(VB)
            .expect("vbucket")
            .receiving_initial_disk_snapshot
    );
    assert!(matches!(
        engine.stream_req(producer, request(1, 0, u64::MAX)),
        StreamReqReply::Accepted(_)
    ));
}

#[test]
fn mutation_outside_the_snapshot_is_rejected() {
    let node = Node::replica();
    let opaque = accepted_stream(&node);
    let engine = &node.engine;
    assert_eq!(
        engine.snapshot_marker(CONSUMER, opaque, VB, 1, 2, marker_flags::MEMORY),
        Status::Success
    );
    assert_eq!(
        engine.mutation(CONSUMER, opaque, Item::mutation(VB, "k", "v", 4)),
        Status::OutOfRange
    );
    assert_eq!(
        engine.mutation(CONSUMER, opaque + 1, Item::mutation(VB, "k", "v", 1)),
        Status::KeyNotFound
    );
}
