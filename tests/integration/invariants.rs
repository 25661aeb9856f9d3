//! Properties that must hold for any message order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;

use dcp_rs::dcp::message::marker_flags;
use dcp_rs::dcp::{DcpConsumer, DurabilityAcker, PeerResponse, SeqnoAck};
use dcp_rs::{Cookie, Item, Status};

use crate::fixtures::{Node, VB};

const CONSUMER: Cookie = Cookie::new(1);

fn reading_consumer(node: &Node, snapshot_end: u64) -> (Arc<DcpConsumer>, u32) {
    let consumer = node.open_consumer(CONSUMER, "invariants");
    let opaque = consumer.add_stream(1, VB, 0).expect("add stream");
    consumer
        .response_handler(&PeerResponse::StreamRequest {
            opaque,
            status: Status::Success,
            failover_log: Vec::new(),
            rollback_seqno: 0,
        })
        .expect("accept");
    consumer
        .snapshot_marker(opaque, VB, 1, snapshot_end, marker_flags::MEMORY)
        .expect("marker");
    (consumer, opaque)
}

#[derive(Clone, Debug)]
enum AckOp {
    Prepare(u64),
    Persist(u64),
    SnapshotEnd,
}

fn ack_op() -> impl Strategy<Value = AckOp> {
    prop_oneof![
        (1u64..50).prop_map(AckOp::Prepare),
        (1u64..50).prop_map(AckOp::Persist),
        Just(AckOp::SnapshotEnd),
    ]
}

proptest! {
    #[test]
    fn accepted_seqnos_never_go_backwards(seqnos in prop::collection::vec(1u64..40, 1..30)) {
        let node = Node::replica();
        let (consumer, opaque) = reading_consumer(&node, 40);
        let mut last = 0;
        let mut dead = false;
        for seqno in seqnos {
            let result = consumer.mutation(opaque, Item::mutation(VB, "k", "v", seqno));
            if dead {
                prop_assert!(result.is_err());
                continue;
            }
            if seqno < last {
                prop_assert_eq!(result.map_err(|e| e.status()), Err(Status::Failed));
                dead = true;
            } else {
                prop_assert!(result.is_ok());
                last = seqno;
            }
        }
        let stream = consumer.stream(VB).expect("stream");
        prop_assert_eq!(stream.last_received_seqno(), last);
        prop_assert_eq!(stream.is_dead(), dead);
        let applied = node.bucket.applied_seqnos(VB);
        prop_assert!(applied.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn each_acknowledged_pair_is_new_and_monotonic(ops in prop::collection::vec(ack_op(), 1..60)) {
        let mut acker = DurabilityAcker::new();
        let mut sent: Vec<SeqnoAck> = Vec::new();
        for op in ops {
            let ack = match op {
                AckOp::Prepare(seqno) => acker.prepare_received(seqno),
                AckOp::Persist(seqno) => acker.persisted(seqno),
                AckOp::SnapshotEnd => acker.snapshot_end(),
            };
            if let Some(ack) = ack {
                prop_assert!(!sent.contains(&ack), "{:?} sent twice", ack);
                if let Some(prev) = sent.last() {
                    prop_assert!(ack.in_memory_seqno >= prev.in_memory_seqno);
                    prop_assert!(ack.on_disk_seqno >= prev.on_disk_seqno);
                }
                prop_assert!(ack.on_disk_seqno <= ack.in_memory_seqno);
                sent.push(ack);
            }
        }
        prop_assert_eq!(acker.last_acked(), sent.last().copied());
    }
}

#[test]
fn racing_deliveries_never_lower_the_watermark() {
    for n in 2..40u64 {
        let node = Node::replica();
        let (consumer, opaque) = reading_consumer(&node, 64);
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [n, n - 1]
            .into_iter()
            .map(|seqno| {
                let consumer = Arc::clone(&consumer);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    consumer
                        .mutation(opaque, Item::mutation(VB, "k", "v", seqno))
                        .is_ok()
                })
            })
            .collect();
        let ok: Vec<bool> = handles
            .into_iter()
            .map(|h| h.join().expect("delivery thread"))
            .collect();

        let stream = consumer.stream(VB).expect("stream");
        assert_eq!(stream.last_received_seqno(), n);
        if ok == [true, true] {
            assert!(!stream.is_dead());
            assert_eq!(node.bucket.applied_seqnos(VB), vec![n - 1, n]);
        } else {
            assert_eq!(ok, [true, false]);
            assert!(stream.is_dead());
            assert_eq!(node.bucket.applied_seqnos(VB), vec![n]);
        }
    }
}

#[test]
fn live_deliveries_racing_the_drain_apply_in_order() {
    const LAST: u64 = 300;
    for _ in 0..5 {
        let node = Node::replica();
        let (consumer, opaque) = reading_consumer(&node, LAST);
        let delivered = AtomicBool::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                loop {
                    let finished = delivered.load(Ordering::Acquire);
                    consumer.drain_buffers();
                    if finished && consumer.stats().buffered_messages == 0 {
                        break;
                    }
                    thread::yield_now();
                }
            });
            for seqno in 1..=LAST {
                if seqno % 25 == 1 {
                    node.bucket.fail_next_applies(3);
                }
                let item = Item::mutation(VB, format!("k{seqno}"), "v", seqno);
                // A buffered delivery reports back-pressure but is kept.
                let _ = consumer.mutation(opaque, item);
            }
            delivered.store(true, Ordering::Release);
        });

        let stream = consumer.stream(VB).expect("stream");
        assert!(!stream.is_dead());
        let applied = node.bucket.applied_seqnos(VB);
        assert_eq!(applied, (1..=LAST).collect::<Vec<_>>());
        assert_eq!(stream.items_applied(), LAST);
    }
}
