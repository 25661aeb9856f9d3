//! Producer to consumer replication over the in-process pipe.

use dcp_rs::config::Config;
use dcp_rs::dcp::{DcpResponse, ProcessOutcome, StreamState};
use dcp_rs::{Cookie, DurabilityLevel, Item, Status, VBucketState};

use crate::fixtures::pipe::{Pipe, Transcript};
use crate::fixtures::{Node, VB};

const PRODUCER: Cookie = Cookie::new(1);
const CONSUMER: Cookie = Cookie::new(2);

fn connect(active: &Node, replica: &Node) {
    active.open_producer(PRODUCER, "replication:active->replica");
    replica.open_consumer(CONSUMER, "replication:active->replica");
    assert_eq!(
        replica.engine.add_stream(CONSUMER, 11, VB, 0),
        Status::Success
    );
}

#[test]
fn backfilled_and_in_memory_items_arrive_once_in_order() {
    let active = Node::active();
    let replica = Node::replica();
    active.write(3);
    active.bucket.create_new_checkpoint(VB).expect("checkpoint");
    active.bucket.persist(VB).expect("persist");
    assert_eq!(active.bucket.remove_closed_checkpoints(VB).expect("evict"), 3);

    connect(&active, &replica);
    let pipe = Pipe::new(&active, PRODUCER, &replica, CONSUMER);
    let mut transcript = Transcript::default();
    pipe.run(&mut transcript);

    let stream = active.producer(PRODUCER).stream(VB).expect("stream");
    assert_eq!(stream.state(), StreamState::InMemory);
    assert_eq!(stream.backfill_items(), 3);
    assert_eq!(transcript.seqnos(), vec![1, 2, 3]);
    let first_marker = transcript.from_producer.iter().find_map(|msg| match msg {
        DcpResponse::SnapshotMarker(marker) => Some(*marker),
        _ => None,
    });
    assert!(first_marker.is_some_and(|marker| marker.is_disk()));

    active.write(2);
    pipe.run(&mut transcript);

    assert_eq!(transcript.seqnos(), vec![1, 2, 3, 4, 5]);
    assert_eq!(replica.bucket.applied_seqnos(VB), vec![1, 2, 3, 4, 5]);
    assert!(transcript.failures.is_empty(), "{:?}", transcript.failures);
    let consumer = replica.consumer(CONSUMER);
    assert_eq!(
        consumer.stream(VB).map(|s| s.last_received_seqno()),
        Some(5)
    );
    assert_eq!(consumer.stats().items_applied, 5);
}

#[test]
fn negotiation_precedes_the_stream_request() {
    let active = Node::active();
    let replica = Node::replica();
    connect(&active, &replica);
    let mut transcript = Transcript::default();
    Pipe::new(&active, PRODUCER, &replica, CONSUMER).run(&mut transcript);

    let kinds = transcript.kinds_from_consumer();
    let request_at = kinds
        .iter()
        .position(|k| *k == "stream_request")
        .expect("stream request");
    let last_control = kinds
        .iter()
        .rposition(|k| *k == "control")
        .expect("controls");
    assert!(last_control < request_at);
    assert!(kinds.contains(&"get_error_map"));
    assert!(replica.consumer(CONSUMER).producer_is_v5());

    let producer = active.producer(PRODUCER);
    assert!(producer.noop_enabled());
    assert_eq!(producer.stats().priority, "high");
}

#[test]
fn diverged_replica_rolls_back_and_resumes() {
    let active = Node::active();
    let replica = Node::replica();
    for _ in 0..3 {
        replica
            .bucket
            .queue_mutation(VB, "local", "diverged")
            .expect("queue");
    }
    active.write(2);

    connect(&active, &replica);
    let mut transcript = Transcript::default();
    Pipe::new(&active, PRODUCER, &replica, CONSUMER).run(&mut transcript);

    let starts: Vec<u64> = transcript
        .from_consumer
        .iter()
        .filter_map(|msg| match msg {
            DcpResponse::StreamRequest { start_seqno, .. } => Some(*start_seqno),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec![3, 0]);
    assert!(replica.bucket.get(VB, b"local").is_none());
    assert_eq!(replica.bucket.applied_seqnos(VB), vec![1, 2]);
}

#[test]
fn durable_writes_are_acknowledged_once_per_watermark() {
    let active = Node::active();
    let mut config = Config::default();
    config.replication.enable_sync_replication = true;
    let replica = Node::new(VBucketState::Replica, config);
    active
        .bucket
        .queue_item(Item::prepare(VB, "durable", "v", 0, DurabilityLevel::Majority))
        .expect("prepare");

    connect(&active, &replica);
    let pipe = Pipe::new(&active, PRODUCER, &replica, CONSUMER);
    let mut transcript = Transcript::default();
    pipe.run(&mut transcript);

    assert!(
        active
            .producer(PRODUCER)
            .sync_replication_enabled()
    );
    let stream = active.producer(PRODUCER).stream(VB).expect("stream");
    assert_eq!(stream.peer_acks(), (1, 0));

    let persisted = replica.bucket.persist(VB).expect("persist");
    replica.engine.conn_map().seqno_persisted(VB, persisted);
    pipe.run(&mut transcript);
    assert_eq!(stream.peer_acks(), (1, 1));

    replica.engine.conn_map().seqno_persisted(VB, persisted);
    pipe.run(&mut transcript);

    let acks: Vec<(u64, u64)> = transcript
        .from_consumer
        .iter()
        .filter_map(|msg| match msg {
            DcpResponse::SeqnoAck {
                in_memory_seqno,
                on_disk_seqno,
                ..
            } => Some((*in_memory_seqno, *on_disk_seqno)),
            _ => None,
        })
        .collect();
    assert_eq!(acks, vec![(1, 0), (1, 1)]);
}

#[test]
fn replica_over_memory_threshold_buffers_then_recovers() {
    let active = Node::active();
    let replica = Node::with_memory(VBucketState::Replica, Config::default(), 1_000);
    replica.memory.charge(930);
    active.write(3);

    connect(&active, &replica);
    let pipe = Pipe::new(&active, PRODUCER, &replica, CONSUMER);
    let mut transcript = Transcript::default();
    pipe.run(&mut transcript);

    assert!(!transcript.failures.is_empty());
    assert!(
        transcript
            .failures
            .iter()
            .all(|(_, status)| *status == Status::TempFail),
        "{:?}",
        transcript.failures
    );
    assert!(replica.bucket.applied_seqnos(VB).is_empty());
    let consumer = replica.consumer(CONSUMER);
    assert!(consumer.stats().buffered_messages > 0);

    assert_eq!(consumer.drain_buffers(), ProcessOutcome::CannotProcess);
    assert!(consumer.backoffs() >= 1);

    replica.memory.release(930);
    assert_eq!(consumer.drain_buffers(), ProcessOutcome::AllProcessed);
    assert_eq!(replica.bucket.applied_seqnos(VB), vec![1, 2, 3]);
    assert_eq!(consumer.stats().buffered_messages, 0);
    assert!(!consumer.handler().wants_disconnect());
}
