//! Connection directory: naming, wakeups, keepalive and teardown.

use dcp_rs::core::Limits;
use dcp_rs::dcp::{DcpResponse, EndStreamReason, RecordingSink, StreamReqReply};
use dcp_rs::{Cookie, Status};

use crate::fixtures::pipe::{Pipe, Transcript};
use crate::fixtures::{Node, VB, request};

fn pump(node: &Node, cookie: Cookie, sink: &mut RecordingSink) {
    loop {
        if node.engine.step(cookie, sink) == Status::Success {
            continue;
        }
        node.producer(cookie).run_background_work();
        if node.engine.step(cookie, sink) != Status::Success {
            return;
        }
    }
}

#[test]
fn reused_name_evicts_the_older_connection() {
    let node = Node::active();
    let old = Cookie::new(1);
    let new = Cookie::new(2);
    node.open_producer(old, "replica-1");
    node.open_producer(new, "replica-1");

    let found = node.engine.conn_map().find_by_name("replica-1").expect("live");
    assert_eq!(found.handler().cookie(), new);
    assert_eq!(found.handler().name(), "eq_dcpq:replica-1");
    drop(found);

    node.engine.conn_map().manage_connections();
    assert!(node.engine.conn_map().find_by_cookie(old).is_none());
    assert!(node.engine.conn_map().find_by_cookie(new).is_some());
    assert_eq!(node.notifier.calls(), vec![(old, Status::Disconnect)]);
    assert_eq!(node.engine.conn_map().dead_connections(), 0);
}

#[test]
fn paused_producer_is_woken_once_per_notification() {
    let node = Node::active();
    let cookie = Cookie::new(7);
    node.open_producer(cookie, "wakeups");
    assert!(matches!(
        node.engine.stream_req(cookie, request(1, 0, u64::MAX)),
        StreamReqReply::Accepted(_)
    ));
    let mut sink = RecordingSink::new();
    pump(&node, cookie, &mut sink);
    node.engine.conn_map().manage_connections();
    node.notifier.clear();

    node.write(1);
    node.engine.conn_map().manage_connections();
    node.engine.conn_map().manage_connections();
    assert_eq!(node.notifier.calls(), vec![(cookie, Status::Success)]);

    pump(&node, cookie, &mut sink);
    assert_eq!(sink.seqnos(), vec![1]);

    // A connection that is running when the wakeup is processed gets none.
    node.notifier.clear();
    node.engine.conn_map().add_connection_to_pending(cookie);
    node.producer(cookie).handler().unpause();
    node.engine.conn_map().process_pending_notifications();
    assert!(node.notifier.calls().is_empty());
}

#[test]
fn silent_peer_is_dropped_after_idle_timeout() {
    let node = Node::active();
    let cookie = Cookie::new(3);
    node.open_producer(cookie, "keepalive");
    assert_eq!(node.engine.control(cookie, 1, "enable_noop", "true"), Status::Success);

    let mut sink = RecordingSink::new();
    assert_eq!(node.engine.step(cookie, &mut sink), Status::Success);
    assert!(matches!(sink.last(), Some(DcpResponse::Noop { .. })));

    node.clock.advance(Limits::default().idle_timeout_ms / 2);
    node.engine.conn_map().manage_connections();
    assert!(node.engine.conn_map().find_by_cookie(cookie).is_some());

    node.clock.advance(Limits::default().idle_timeout_ms);
    node.engine.conn_map().manage_connections();
    assert!(node.engine.conn_map().find_by_cookie(cookie).is_none());
    assert_eq!(node.notifier.count(cookie), 1);
    assert_eq!(node.engine.step(cookie, &mut sink), Status::Disconnect);
}

#[test]
fn consumer_tracks_producer_traffic_and_goes_stale_without_it() {
    let active = Node::active();
    let replica = Node::replica();
    let producer = Cookie::new(1);
    let consumer = Cookie::new(2);
    active.open_producer(producer, "stale");
    replica.open_consumer(consumer, "stale");
    assert_eq!(replica.engine.add_stream(consumer, 1, VB, 0), Status::Success);
    let pipe = Pipe::new(&active, producer, &replica, consumer);
    pipe.run(&mut Transcript::default());

    let before = replica.consumer(consumer).last_message_time();
    let now = replica.clock.advance(60_000);
    active.write(1);
    pipe.run(&mut Transcript::default());
    assert_eq!(replica.consumer(consumer).last_message_time(), now);
    assert!(now > before);

    replica.clock.advance(Limits::default().idle_timeout_ms + 1);
    replica.engine.conn_map().manage_connections();
    assert!(replica.engine.conn_map().find_by_cookie(consumer).is_none());
    assert_eq!(
        replica.notifier.calls(),
        vec![(consumer, Status::Disconnect)]
    );
}

#[test]
fn closed_stream_reaches_the_consumer_when_requested() {
    let active = Node::active();
    let replica = Node::replica();
    let producer = Cookie::new(1);
    let consumer = Cookie::new(2);
    active.open_producer(producer, "close");
    replica.open_consumer(consumer, "close");
    assert_eq!(
        active
            .engine
            .control(producer, 1, "send_stream_end_on_client_close_stream", "true"),
        Status::Success
    );
    assert_eq!(replica.engine.add_stream(consumer, 1, VB, 0), Status::Success);
    let pipe = Pipe::new(&active, producer, &replica, consumer);
    let mut transcript = Transcript::default();
    pipe.run(&mut transcript);

    assert_eq!(active.engine.close_stream(producer, 1, VB), Status::Success);
    pipe.run(&mut transcript);

    assert!(transcript.from_producer.iter().any(|msg| matches!(
        msg,
        DcpResponse::StreamEnd {
            reason: EndStreamReason::Closed,
            ..
        }
    )));
    assert!(active.producer(producer).stream(VB).is_none());
    assert!(
        replica
            .consumer(consumer)
            .stream(VB)
            .is_none_or(|stream| stream.is_dead())
    );
}

#[test]
fn shutdown_disconnects_everyone_and_refuses_new_opens() {
    let node = Node::active();
    let cookie = Cookie::new(1);
    node.open_producer(cookie, "shutdown");
    node.engine.conn_map().shutdown_all_connections();

    assert_eq!(node.notifier.calls(), vec![(cookie, Status::Disconnect)]);
    let mut sink = RecordingSink::new();
    assert_eq!(node.engine.step(cookie, &mut sink), Status::Disconnect);
    assert_eq!(
        node.engine.open(Cookie::new(2), 0, "late", 0),
        Status::Disconnect
    );
}
