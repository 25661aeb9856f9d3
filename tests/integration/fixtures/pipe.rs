//! In-process transport between a consumer on one node and a producer on
//! another. Each side steps into a recording sink; the pipe delivers what
//! was sent to the peer's engine callbacks and feeds replies back.

use dcp_rs::dcp::{DcpResponse, PeerResponse, RecordingSink, StreamReqReply, StreamRequest};
use dcp_rs::{Cookie, Status};

use super::Node;

/// Everything that crossed the pipe, plus any callback that did not succeed.
#[derive(Debug, Default)]
pub struct Transcript {
    pub from_producer: Vec<DcpResponse>,
    pub from_consumer: Vec<DcpResponse>,
    pub failures: Vec<(&'static str, Status)>,
}

impl Transcript {
    /// Seqnos of item-bearing messages the producer sent.
    pub fn seqnos(&self) -> Vec<u64> {
        self.from_producer
            .iter()
            .filter_map(DcpResponse::by_seqno)
            .collect()
    }

    pub fn kinds_from_consumer(&self) -> Vec<&'static str> {
        self.from_consumer.iter().map(DcpResponse::kind).collect()
    }
}

pub struct Pipe<'a> {
    pub active: &'a Node,
    pub replica: &'a Node,
    pub producer: Cookie,
    pub consumer: Cookie,
}

impl<'a> Pipe<'a> {
    pub fn new(active: &'a Node, producer: Cookie, replica: &'a Node, consumer: Cookie) -> Self {
        Self {
            active,
            replica,
            producer,
            consumer,
        }
    }

    /// Shuttle messages both ways until neither side has anything to send.
    pub fn run(&self, transcript: &mut Transcript) {
        for _ in 0..1_000 {
            let moved = self.drain_consumer(transcript) + self.drain_producer(transcript);
            if moved == 0 {
                return;
            }
        }
        panic!("pipe did not quiesce");
    }

    fn drain_consumer(&self, transcript: &mut Transcript) -> usize {
        let mut sink = RecordingSink::new();
        while self.replica.engine.step(self.consumer, &mut sink) == Status::Success {}
        let sent = sink.take();
        for msg in &sent {
            self.deliver_to_producer(msg, transcript);
        }
        let moved = sent.len();
        transcript.from_consumer.extend(sent);
        moved
    }

    fn drain_producer(&self, transcript: &mut Transcript) -> usize {
        let mut sink = RecordingSink::new();
        loop {
            if self.active.engine.step(self.producer, &mut sink) == Status::Success {
                continue;
            }
            if let Some(conn) = self.active.engine.conn_map().find_by_cookie(self.producer)
                && let Some(producer) = conn.as_producer()
            {
                producer.run_background_work();
            }
            if self.active.engine.step(self.producer, &mut sink) != Status::Success {
                break;
            }
        }
        let sent = sink.take();
        for msg in &sent {
            self.deliver_to_consumer(msg, transcript);
        }
        let moved = sent.len();
        transcript.from_producer.extend(sent);
        moved
    }

    fn deliver_to_producer(&self, msg: &DcpResponse, transcript: &mut Transcript) {
        let engine = &self.active.engine;
        let cookie = self.producer;
        let reply = match msg {
            DcpResponse::Control { opaque, key, value } => {
                let status = engine.control(cookie, *opaque, key, value);
                Some(PeerResponse::Control {
                    opaque: *opaque,
                    status,
                })
            }
            DcpResponse::GetErrorMap { opaque, .. } => Some(PeerResponse::GetErrorMap {
                opaque: *opaque,
                status: Status::Success,
            }),
            DcpResponse::StreamRequest {
                opaque,
                vbid,
                flags,
                start_seqno,
                end_seqno,
                vb_uuid,
                snap_start,
                snap_end,
            } => {
                let req = StreamRequest {
                    flags: *flags,
                    opaque: *opaque,
                    vbid: *vbid,
                    start_seqno: *start_seqno,
                    end_seqno: *end_seqno,
                    vb_uuid: *vb_uuid,
                    snap_start: *snap_start,
                    snap_end: *snap_end,
                };
                let (status, failover_log, rollback_seqno) = match engine.stream_req(cookie, req) {
                    StreamReqReply::Accepted(log) => (Status::Success, log, 0),
                    StreamReqReply::Rollback(seqno) => (Status::Rollback, Vec::new(), seqno),
                    StreamReqReply::Rejected(status) => (status, Vec::new(), 0),
                };
                Some(PeerResponse::StreamRequest {
                    opaque: *opaque,
                    status,
                    failover_log,
                    rollback_seqno,
                })
            }
            DcpResponse::BufferAck { opaque, bytes } => {
                record(
                    transcript,
                    "buffer_ack",
                    engine.buffer_acknowledgement(cookie, *opaque, super::VB, *bytes),
                );
                None
            }
            DcpResponse::SeqnoAck {
                opaque,
                vbid,
                in_memory_seqno,
                on_disk_seqno,
            } => {
                record(
                    transcript,
                    "seqno_ack",
                    engine.seqno_acknowledged(
                        cookie,
                        *opaque,
                        *vbid,
                        *in_memory_seqno,
                        *on_disk_seqno,
                    ),
                );
                None
            }
            DcpResponse::SnapshotMarkerResponse { opaque, status } => {
                record(
                    transcript,
                    "snapshot_marker_response",
                    engine.response_handler(
                        cookie,
                        &PeerResponse::SnapshotMarker {
                            opaque: *opaque,
                            status: *status,
                        },
                    ),
                );
                None
            }
            // Addressed to whoever called add_stream, not to the producer.
            DcpResponse::AddStreamResponse { .. } => None,
            other => panic!("consumer sent unexpected {}", other.kind()),
        };
        if let Some(reply) = reply {
            let status = self.replica.engine.response_handler(self.consumer, &reply);
            record(transcript, "consumer_response", status);
        }
    }

    fn deliver_to_consumer(&self, msg: &DcpResponse, transcript: &mut Transcript) {
        let engine = &self.replica.engine;
        let cookie = self.consumer;
        let item = || msg.item().map(|item| (**item).clone()).expect("item");
        let (kind, status) = match msg {
            DcpResponse::SnapshotMarker(marker) => (
                "snapshot_marker",
                engine.snapshot_marker(
                    cookie,
                    marker.opaque,
                    marker.vbid,
                    marker.start_seqno,
                    marker.end_seqno,
                    marker.flags,
                ),
            ),
            DcpResponse::Mutation { opaque, .. } => {
                ("mutation", engine.mutation(cookie, *opaque, item()))
            }
            DcpResponse::Deletion {
                opaque,
                include_delete_time,
                ..
            } => {
                let status = if *include_delete_time {
                    engine.deletion_v2(cookie, *opaque, item())
                } else {
                    engine.deletion(cookie, *opaque, item())
                };
                ("deletion", status)
            }
            DcpResponse::Expiration { opaque, .. } => {
                ("expiration", engine.expiration(cookie, *opaque, item()))
            }
            DcpResponse::Prepare { opaque, .. } => {
                ("prepare", engine.prepare(cookie, *opaque, item()))
            }
            DcpResponse::Commit { opaque, .. } => {
                ("commit", engine.commit(cookie, *opaque, item()))
            }
            DcpResponse::Abort { opaque, .. } => ("abort", engine.abort(cookie, *opaque, item())),
            DcpResponse::SystemEvent { opaque, .. } => {
                ("system_event", engine.system_event(cookie, *opaque, item()))
            }
            DcpResponse::StreamEnd {
                opaque,
                vbid,
                reason,
            } => (
                "stream_end",
                engine.stream_end(cookie, *opaque, *vbid, *reason),
            ),
            DcpResponse::SetVBucketState {
                opaque,
                vbid,
                state,
            } => {
                let status = engine.set_vbucket_state(cookie, *opaque, *vbid, *state);
                let reply = PeerResponse::SetVBucketState {
                    opaque: *opaque,
                    status,
                };
                record(
                    transcript,
                    "producer_response",
                    self.active.engine.response_handler(self.producer, &reply),
                );
                ("set_vbucket_state", status)
            }
            DcpResponse::Noop { opaque } => {
                let status = engine.noop(cookie, *opaque);
                let reply = PeerResponse::Noop {
                    opaque: *opaque,
                    status,
                };
                record(
                    transcript,
                    "producer_response",
                    self.active.engine.response_handler(self.producer, &reply),
                );
                ("noop", status)
            }
            other => panic!("producer sent unexpected {}", other.kind()),
        };
        record(transcript, kind, status);
    }
}

fn record(transcript: &mut Transcript, kind: &'static str, status: Status) {
    if status != Status::Success {
        transcript.failures.push((kind, status));
    }
}
