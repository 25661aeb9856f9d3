//! Engine callback surface.
//!
//! Every callback names its connection by cookie and answers with a
//! [`Status`]. Errors are logged here with the connection's span; the
//! transport only sees the status.

use std::sync::Arc;

use crate::core::{Cookie, FailoverEntry, Item, Status, VBucketState, Vbid};

use super::conn_map::DcpConnMap;
use super::connection::Step;
use super::consumer::DcpConsumer;
use super::context::EngineContext;
use super::error::DcpError;
use super::message::{EndStreamReason, PeerResponse, open_flags};
use super::producer::DcpProducer;
use super::sink::MessageSink;
use super::stream::StreamRequest;

/// Answer to a stream request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamReqReply {
    /// The stream exists; here is our failover log.
    Accepted(Vec<FailoverEntry>),
    Rollback(u64),
    Rejected(Status),
}

pub struct DcpEngine {
    conn_map: DcpConnMap,
}

fn status_of(cookie: Cookie, op: &'static str, result: Result<(), DcpError>) -> Status {
    match result {
        Ok(()) => Status::Success,
        Err(err) => {
            let status = err.status();
            if err.transience().is_retryable() {
                tracing::debug!(?cookie, op, error = %err, "retry later");
            } else {
                tracing::warn!(?cookie, op, error = %err, %status, "request failed");
            }
            status
        }
    }
}

impl DcpEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            conn_map: DcpConnMap::new(ctx),
        }
    }

    pub fn conn_map(&self) -> &DcpConnMap {
        &self.conn_map
    }

    fn producer(&self, cookie: Cookie) -> Result<Arc<DcpProducer>, Status> {
        let conn = self
            .conn_map
            .find_by_cookie(cookie)
            .ok_or(Status::Disconnect)?;
        conn.as_producer().cloned().ok_or(Status::NotSupported)
    }

    fn consumer(&self, cookie: Cookie) -> Result<Arc<DcpConsumer>, Status> {
        let conn = self
            .conn_map
            .find_by_cookie(cookie)
            .ok_or(Status::Disconnect)?;
        conn.as_consumer().cloned().ok_or(Status::NotSupported)
    }

    fn on_producer(
        &self,
        cookie: Cookie,
        op: &'static str,
        f: impl FnOnce(&DcpProducer) -> Result<(), DcpError>,
    ) -> Status {
        match self.producer(cookie) {
            Ok(producer) => status_of(cookie, op, f(&producer)),
            Err(status) => status,
        }
    }

    fn on_consumer(
        &self,
        cookie: Cookie,
        op: &'static str,
        f: impl FnOnce(&DcpConsumer) -> Result<(), DcpError>,
    ) -> Status {
        match self.consumer(cookie) {
            Ok(consumer) => status_of(cookie, op, f(&consumer)),
            Err(status) => status,
        }
    }

    pub fn open(&self, cookie: Cookie, opaque: u32, name: &str, flags: u32) -> Status {
        if flags & open_flags::NOTIFIER != 0 {
            tracing::warn!(?cookie, name, "notifier connections are not supported");
            return Status::NotSupported;
        }
        let opened = if flags & open_flags::PRODUCER != 0 {
            self.conn_map.new_producer(cookie, name, flags).is_some()
        } else {
            self.conn_map.new_consumer(cookie, name).is_some()
        };
        if opened {
            tracing::debug!(?cookie, opaque, name, flags, "dcp open");
            Status::Success
        } else {
            Status::Disconnect
        }
    }

    pub fn add_stream(&self, cookie: Cookie, opaque: u32, vbid: Vbid, flags: u32) -> Status {
        self.on_consumer(cookie, "add_stream", |c| {
            c.add_stream(opaque, vbid, flags).map(|_| ())
        })
    }

    pub fn close_stream(&self, cookie: Cookie, opaque: u32, vbid: Vbid) -> Status {
        match self.conn_map.find_by_cookie(cookie) {
            Some(conn) => {
                let result = match (conn.as_producer(), conn.as_consumer()) {
                    (Some(p), _) => p.close_stream(opaque, vbid),
                    (_, Some(c)) => c.close_stream(opaque, vbid),
                    (None, None) => Ok(()),
                };
                status_of(cookie, "close_stream", result)
            }
            None => Status::Disconnect,
        }
    }

    pub fn stream_req(&self, cookie: Cookie, req: StreamRequest) -> StreamReqReply {
        let producer = match self.producer(cookie) {
            Ok(producer) => producer,
            Err(status) => return StreamReqReply::Rejected(status),
        };
        match producer.stream_req(req) {
            Ok(failover_log) => {
                self.conn_map.add_vb_conn(req.vbid, cookie);
                StreamReqReply::Accepted(failover_log)
            }
            Err(DcpError::Rollback { seqno }) => StreamReqReply::Rollback(seqno),
            Err(err) => StreamReqReply::Rejected(status_of(cookie, "stream_req", Err(err))),
        }
    }

    pub fn get_failover_log(
        &self,
        cookie: Cookie,
        opaque: u32,
        vbid: Vbid,
    ) -> Result<Vec<FailoverEntry>, Status> {
        let producer = self.producer(cookie)?;
        producer.get_failover_log(vbid).map_err(|err| {
            tracing::debug!(?cookie, opaque, vb = %vbid, error = %err, "no failover log");
            err.status()
        })
    }

    pub fn stream_end(
        &self,
        cookie: Cookie,
        opaque: u32,
        vbid: Vbid,
        reason: EndStreamReason,
    ) -> Status {
        self.on_consumer(cookie, "stream_end", |c| c.stream_end(opaque, vbid, reason))
    }

    pub fn snapshot_marker(
        &self,
        cookie: Cookie,
        opaque: u32,
        vbid: Vbid,
        start_seqno: u64,
        end_seqno: u64,
        flags: u32,
    ) -> Status {
        self.on_consumer(cookie, "snapshot_marker", |c| {
            c.snapshot_marker(opaque, vbid, start_seqno, end_seqno, flags)
        })
    }

    pub fn mutation(&self, cookie: Cookie, opaque: u32, item: Item) -> Status {
        self.on_consumer(cookie, "mutation", |c| c.mutation(opaque, item))
    }

    pub fn deletion(&self, cookie: Cookie, opaque: u32, item: Item) -> Status {
        self.on_consumer(cookie, "deletion", |c| c.deletion(opaque, item))
    }

    pub fn deletion_v2(&self, cookie: Cookie, opaque: u32, item: Item) -> Status {
        self.on_consumer(cookie, "deletion_v2", |c| c.deletion_v2(opaque, item))
    }

    pub fn expiration(&self, cookie: Cookie, opaque: u32, item: Item) -> Status {
        self.on_consumer(cookie, "expiration", |c| c.expiration(opaque, item))
    }

    pub fn prepare(&self, cookie: Cookie, opaque: u32, item: Item) -> Status {
        self.on_consumer(cookie, "prepare", |c| c.prepare(opaque, item))
    }

    pub fn commit(&self, cookie: Cookie, opaque: u32, item: Item) -> Status {
        self.on_consumer(cookie, "commit", |c| c.commit(opaque, item))
    }

    pub fn abort(&self, cookie: Cookie, opaque: u32, item: Item) -> Status {
        self.on_consumer(cookie, "abort", |c| c.abort(opaque, item))
    }

    pub fn system_event(&self, cookie: Cookie, opaque: u32, item: Item) -> Status {
        self.on_consumer(cookie, "system_event", |c| c.system_event(opaque, item))
    }

    pub fn flush(&self, cookie: Cookie, opaque: u32, vbid: Vbid) -> Status {
        tracing::debug!(?cookie, opaque, vb = %vbid, "flush is not supported");
        Status::NotSupported
    }

    pub fn set_vbucket_state(
        &self,
        cookie: Cookie,
        opaque: u32,
        vbid: Vbid,
        state: VBucketState,
    ) -> Status {
        self.on_consumer(cookie, "set_vbucket_state", |c| {
            c.set_vbucket_state(opaque, vbid, state)
        })
    }

    pub fn noop(&self, cookie: Cookie, opaque: u32) -> Status {
        self.on_consumer(cookie, "noop", |c| c.noop(opaque))
    }

    pub fn buffer_acknowledgement(
        &self,
        cookie: Cookie,
        opaque: u32,
        vbid: Vbid,
        bytes: u32,
    ) -> Status {
        tracing::trace!(?cookie, opaque, bytes, "buffer acknowledgement");
        self.on_producer(cookie, "buffer_acknowledgement", |p| {
            p.buffer_acknowledgement(vbid, bytes)
        })
    }

    pub fn control(&self, cookie: Cookie, opaque: u32, key: &str, value: &str) -> Status {
        tracing::trace!(?cookie, opaque, key, value, "control");
        self.on_producer(cookie, "control", |p| p.control(key, value))
    }

    pub fn response_handler(&self, cookie: Cookie, resp: &PeerResponse) -> Status {
        match self.conn_map.find_by_cookie(cookie) {
            Some(conn) => {
                let result = match (conn.as_producer(), conn.as_consumer()) {
                    (Some(p), _) => p.response_handler(resp),
                    (_, Some(c)) => c.response_handler(resp),
                    (None, None) => Ok(()),
                };
                status_of(cookie, "response_handler", result)
            }
            None => Status::Disconnect,
        }
    }

    pub fn seqno_acknowledged(
        &self,
        cookie: Cookie,
        opaque: u32,
        vbid: Vbid,
        prepared_seqno: u64,
        persisted_seqno: u64,
    ) -> Status {
        tracing::trace!(?cookie, opaque, vb = %vbid, prepared_seqno, persisted_seqno, "seqno ack");
        self.on_producer(cookie, "seqno_acknowledged", |p| {
            p.seqno_acknowledged(vbid, prepared_seqno, persisted_seqno)
        })
    }

    /// Pull the next outbound message for the connection into `sink`.
    pub fn step(&self, cookie: Cookie, sink: &mut dyn MessageSink) -> Status {
        let Some(conn) = self.conn_map.find_by_cookie(cookie) else {
            return Status::Disconnect;
        };
        match conn.step(sink) {
            Ok(Step::Sent) => Status::Success,
            Ok(Step::WouldBlock) => Status::WouldBlock,
            Err(err) => {
                tracing::debug!(?cookie, error = %err, "step failed");
                err.status()
            }
        }
    }

    /// The transport lost the connection.
    pub fn disconnect(&self, cookie: Cookie) {
        self.conn_map.disconnect(cookie);
    }
}

impl std::fmt::Debug for DcpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpEngine")
            .field("conn_map", &self.conn_map)
            .finish()
    }
}
