//! Consumer connection: applies streams from a remote producer.
//!
//! Incoming messages are routed to the passive stream for their vbucket.
//! Messages a stream could not apply stay in its buffer; a background task
//! drains those buffers and the connection is woken when there is something
//! to acknowledge. `step` first walks the control negotiation, then sends
//! buffer acknowledgements and per-stream replies.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use crate::config::FullPolicy;
use crate::core::{Cookie, Item, Status, VBucketState, Vbid};
use crate::metrics;

use super::connection::{ConnHandler, ConnKind, Step};
use super::context::EngineContext;
use super::error::DcpError;
use super::flow_control::FlowControl;
use super::message::{DcpResponse, EndStreamReason, PeerResponse, SnapshotMarker};
use super::ready_queue::VbReadyList;
use super::sink::MessageSink;
use super::stream::{PassiveStream, ProcessResult};
use super::task::{Task, TaskHandle, TaskOutcome};

const CONTROL_OPAQUE_BASE: u32 = 0x2000_0000;
const ERROR_MAP_VERSION: u16 = 2;

/// Result of one buffer-drain pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    AllProcessed,
    MoreToProcess,
    CannotProcess,
    /// The connection is going away.
    StopProcessing,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub streams: usize,
    pub buffered_messages: usize,
    pub buffered_bytes: usize,
    pub items_applied: u64,
    pub backoffs: u64,
    pub received_bytes: u64,
    pub freed_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorMapState {
    PendingRequest,
    PendingResponse,
    Skip,
}

#[derive(Debug)]
struct Negotiation {
    error_map: ErrorMapState,
    producer_is_v5: bool,
    enable_noop_sent: bool,
    noop_interval_sent: bool,
    priority_sent: bool,
    sync_replication_sent: bool,
    next_opaque: u32,
}

impl Negotiation {
    fn control(&mut self, key: &str, value: impl Into<String>) -> DcpResponse {
        let opaque = self.next_opaque;
        self.next_opaque = self.next_opaque.wrapping_add(1);
        DcpResponse::Control {
            opaque,
            key: key.to_string(),
            value: value.into(),
        }
    }
}

enum Negotiate {
    Send(DcpResponse),
    /// Waiting for the producer's error map reply.
    Wait,
    Done,
}

pub struct DcpConsumer {
    handler: ConnHandler,
    ctx: Arc<EngineContext>,
    streams: RwLock<BTreeMap<Vbid, Arc<PassiveStream>>>,
    next_opaque: AtomicU32,
    ready: Mutex<VbReadyList>,
    buffered: Mutex<VbReadyList>,
    negotiation: Mutex<Negotiation>,
    flow: Mutex<FlowControl>,
    last_message_ms: AtomicU64,
    new_data_refused: AtomicBool,
    backoffs: AtomicU64,
    processor: TaskHandle,
}

struct BufferProcessorTask {
    consumer: Weak<DcpConsumer>,
}

impl Task for BufferProcessorTask {
    fn name(&self) -> &'static str {
        "buffer_processor"
    }

    fn run(&self) -> TaskOutcome {
        let Some(consumer) = self.consumer.upgrade() else {
            return TaskOutcome::Done;
        };
        match consumer.process_buffered_items() {
            ProcessOutcome::AllProcessed | ProcessOutcome::StopProcessing => TaskOutcome::Done,
            ProcessOutcome::MoreToProcess => TaskOutcome::Reschedule,
            ProcessOutcome::CannotProcess => TaskOutcome::Snooze(Duration::from_millis(
                consumer.ctx.limits.processor_backoff_ms,
            )),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DcpConsumer {
    pub fn new(ctx: Arc<EngineContext>, cookie: Cookie, name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let span = ctx.bucket.connection_span(ConnKind::Consumer.as_str(), &name);
        let now = ctx.now_ms();
        Arc::new_cyclic(|weak: &Weak<DcpConsumer>| {
            let task: Arc<dyn Task> = Arc::new(BufferProcessorTask {
                consumer: weak.clone(),
            });
            let processor = match &ctx.tasks {
                Some(pool) => pool.register(task),
                None => TaskHandle::detached(task),
            };
            tracing::info!(parent: &span, "consumer opened");
            DcpConsumer {
                handler: ConnHandler::new(
                    cookie,
                    name,
                    ConnKind::Consumer,
                    span,
                    Arc::clone(&ctx.pending),
                ),
                streams: RwLock::new(BTreeMap::new()),
                next_opaque: AtomicU32::new(1),
                ready: Mutex::new(VbReadyList::new()),
                buffered: Mutex::new(VbReadyList::new()),
                negotiation: Mutex::new(Negotiation {
                    error_map: ErrorMapState::PendingRequest,
                    producer_is_v5: false,
                    enable_noop_sent: false,
                    noop_interval_sent: false,
                    priority_sent: false,
                    sync_replication_sent: false,
                    next_opaque: CONTROL_OPAQUE_BASE,
                }),
                flow: Mutex::new(FlowControl::new(
                    ctx.replication.flow_control_policy,
                    &ctx.limits,
                    now,
                )),
                last_message_ms: AtomicU64::new(now),
                new_data_refused: AtomicBool::new(false),
                backoffs: AtomicU64::new(0),
                processor,
                ctx,
            }
        })
    }

    pub fn handler(&self) -> &ConnHandler {
        &self.handler
    }

    pub fn name(&self) -> &str {
        self.handler.name()
    }

    pub fn stream(&self, vbid: Vbid) -> Option<Arc<PassiveStream>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&vbid)
            .cloned()
    }

    pub fn vbuckets(&self) -> Vec<Vbid> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Last time anything arrived from the producer.
    pub fn last_message_time(&self) -> u64 {
        self.last_message_ms.load(Ordering::Acquire)
    }

    pub fn backoffs(&self) -> u64 {
        self.backoffs.load(Ordering::Relaxed)
    }

    pub fn producer_is_v5(&self) -> bool {
        lock(&self.negotiation).producer_is_v5
    }

    /// No traffic from a producer that promised noops for longer than the
    /// idle timeout.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        lock(&self.negotiation).enable_noop_sent
            && now_ms.saturating_sub(self.last_message_time()) > self.ctx.limits.idle_timeout_ms
    }

    pub fn check_liveness(&self, now_ms: u64) {
        if self.is_stale(now_ms) {
            tracing::warn!(
                parent: self.handler.span(),
                last_message_ms = self.last_message_time(),
                now_ms,
                "producer silent past idle timeout"
            );
            self.handler.set_disconnect();
        }
    }

    pub fn step(&self, sink: &mut dyn MessageSink) -> Result<Step, DcpError> {
        let _enter = self.handler.span().enter();
        if self.new_data_refused.load(Ordering::Acquire) || self.handler.wants_disconnect() {
            return Err(DcpError::Disconnect);
        }
        self.handler.unpause();

        if let Some(msg) = self.handler.take_rejected() {
            return self.handler.send(sink, msg);
        }

        match self.negotiate() {
            Negotiate::Send(msg) => return self.handler.send(sink, msg),
            Negotiate::Wait => {
                self.handler.pause();
                return Ok(Step::WouldBlock);
            }
            Negotiate::Done => {}
        }

        let now = self.ctx.now_ms();
        if let Some(bytes) = lock(&self.flow).take_buffer_ack(now) {
            tracing::trace!(bytes, "acknowledging freed bytes");
            return self
                .handler
                .send(sink, DcpResponse::BufferAck { opaque: 0, bytes });
        }

        if let Some(msg) = self.next_from_streams() {
            return self.handler.send(sink, msg);
        }

        self.handler.pause();
        if !lock(&self.ready).is_empty() {
            self.handler.notify_paused();
        }
        Ok(Step::WouldBlock)
    }

    fn negotiate(&self) -> Negotiate {
        let mut n = lock(&self.negotiation);
        if let Some(window) = lock(&self.flow).take_window_announcement() {
            return Negotiate::Send(n.control("connection_buffer_size", window.to_string()));
        }
        match n.error_map {
            ErrorMapState::PendingRequest => {
                n.error_map = ErrorMapState::PendingResponse;
                let opaque = n.next_opaque;
                n.next_opaque = n.next_opaque.wrapping_add(1);
                return Negotiate::Send(DcpResponse::GetErrorMap {
                    opaque,
                    version: ERROR_MAP_VERSION,
                });
            }
            ErrorMapState::PendingResponse => return Negotiate::Wait,
            ErrorMapState::Skip => {}
        }
        if !n.enable_noop_sent {
            n.enable_noop_sent = true;
            return Negotiate::Send(n.control("enable_noop", "true"));
        }
        if !n.noop_interval_sent {
            n.noop_interval_sent = true;
            let secs = self.ctx.limits.noop_interval_ms / 1_000;
            return Negotiate::Send(n.control("set_noop_interval", secs.to_string()));
        }
        if !n.priority_sent {
            n.priority_sent = true;
            return Negotiate::Send(n.control("set_priority", "high"));
        }
        if self.ctx.replication.enable_sync_replication
            && n.producer_is_v5
            && !n.sync_replication_sent
        {
            n.sync_replication_sent = true;
            return Negotiate::Send(n.control("enable_sync_replication", "true"));
        }
        Negotiate::Done
    }

    /// Create a passive stream for `vbid`; returns the stream's opaque.
    pub fn add_stream(&self, caller_opaque: u32, vbid: Vbid, flags: u32) -> Result<u32, DcpError> {
        let _enter = self.handler.span().enter();
        let info = self
            .ctx
            .vbuckets()
            .info(vbid)
            .ok_or(DcpError::NotMyVbucket { vbid })?;
        if !info.state.accepts_replication() {
            return Err(DcpError::NotMyVbucket { vbid });
        }
        let opaque = {
            let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
            if streams.get(&vbid).is_some_and(|s| !s.is_dead()) {
                return Err(DcpError::StreamExists { vbid });
            }
            let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
            let stream =
                PassiveStream::new(&self.ctx, self.name(), opaque, caller_opaque, vbid, flags)?;
            streams.insert(vbid, Arc::new(stream));
            opaque
        };
        tracing::info!(vb = %vbid, opaque, caller_opaque, flags, "passive stream added");
        self.mark_ready(vbid);
        Ok(opaque)
    }

    pub fn snapshot_marker(
        &self,
        opaque: u32,
        vbid: Vbid,
        start_seqno: u64,
        end_seqno: u64,
        flags: u32,
    ) -> Result<(), DcpError> {
        let marker = SnapshotMarker {
            opaque,
            vbid,
            start_seqno,
            end_seqno,
            flags,
        };
        self.message_received(opaque, vbid, DcpResponse::SnapshotMarker(marker))
    }

    pub fn mutation(&self, opaque: u32, item: Item) -> Result<(), DcpError> {
        let vbid = item.vbid;
        let item = Arc::new(item);
        self.message_received(opaque, vbid, DcpResponse::Mutation { opaque, item })
    }

    pub fn deletion(&self, opaque: u32, item: Item) -> Result<(), DcpError> {
        self.delete_item(opaque, item, false)
    }

    pub fn deletion_v2(&self, opaque: u32, item: Item) -> Result<(), DcpError> {
        self.delete_item(opaque, item, true)
    }

    fn delete_item(&self, opaque: u32, item: Item, include_delete_time: bool) -> Result<(), DcpError> {
        let vbid = item.vbid;
        let msg = DcpResponse::Deletion {
            opaque,
            item: Arc::new(item),
            include_delete_time,
        };
        self.message_received(opaque, vbid, msg)
    }

    pub fn expiration(&self, opaque: u32, item: Item) -> Result<(), DcpError> {
        let vbid = item.vbid;
        let item = Arc::new(item);
        self.message_received(opaque, vbid, DcpResponse::Expiration { opaque, item })
    }

    pub fn prepare(&self, opaque: u32, item: Item) -> Result<(), DcpError> {
        let vbid = item.vbid;
        let item = Arc::new(item);
        self.message_received(opaque, vbid, DcpResponse::Prepare { opaque, item })
    }

    pub fn commit(&self, opaque: u32, item: Item) -> Result<(), DcpError> {
        let vbid = item.vbid;
        let item = Arc::new(item);
        self.message_received(opaque, vbid, DcpResponse::Commit { opaque, item })
    }

    pub fn abort(&self, opaque: u32, item: Item) -> Result<(), DcpError> {
        let vbid = item.vbid;
        let item = Arc::new(item);
        self.message_received(opaque, vbid, DcpResponse::Abort { opaque, item })
    }

    pub fn system_event(&self, opaque: u32, item: Item) -> Result<(), DcpError> {
        let vbid = item.vbid;
        let item = Arc::new(item);
        self.message_received(opaque, vbid, DcpResponse::SystemEvent { opaque, item })
    }

    pub fn stream_end(
        &self,
        opaque: u32,
        vbid: Vbid,
        reason: EndStreamReason,
    ) -> Result<(), DcpError> {
        self.message_received(
            opaque,
            vbid,
            DcpResponse::StreamEnd {
                opaque,
                vbid,
                reason,
            },
        )
    }

    /// Takeover: the producer hands us the vbucket state.
    pub fn set_vbucket_state(
        &self,
        opaque: u32,
        vbid: Vbid,
        state: VBucketState,
    ) -> Result<(), DcpError> {
        let _enter = self.handler.span().enter();
        self.touch();
        let stream = self.stream_for(opaque, vbid)?;
        self.ctx.vbuckets().set_state(vbid, state)?;
        tracing::info!(vb = %vbid, state = %state, "vbucket state set by producer");
        if state == VBucketState::Active {
            let freed = stream.set_dead(EndStreamReason::Ok);
            self.free(freed);
        }
        Ok(())
    }

    pub fn noop(&self, opaque: u32) -> Result<(), DcpError> {
        self.touch();
        tracing::trace!(parent: self.handler.span(), opaque, "noop from producer");
        Ok(())
    }

    /// The producer answered a request we sent.
    pub fn response_handler(&self, resp: &PeerResponse) -> Result<(), DcpError> {
        let _enter = self.handler.span().enter();
        self.touch();
        match resp {
            PeerResponse::StreamRequest {
                opaque,
                status,
                failover_log,
                rollback_seqno,
            } => {
                let stream = self.stream_by_opaque(*opaque).ok_or_else(|| {
                    DcpError::invalid(format!("no pending stream for opaque {opaque}"))
                })?;
                match status {
                    Status::Success => {
                        stream.accept_stream(&self.ctx, Status::Success, failover_log.clone())?
                    }
                    Status::Rollback => {
                        if let Err(err) = stream.rollback(&self.ctx, *rollback_seqno) {
                            tracing::error!(
                                vb = %stream.vbid(),
                                rollback_seqno,
                                error = %err,
                                "rollback failed"
                            );
                            stream.accept_stream(&self.ctx, err.status(), Vec::new())?;
                        }
                    }
                    other => stream.accept_stream(&self.ctx, *other, Vec::new())?,
                }
                self.free(stream.take_discarded_bytes());
                self.mark_ready(stream.vbid());
                Ok(())
            }
            PeerResponse::GetErrorMap { status, .. } => {
                let mut n = lock(&self.negotiation);
                if n.error_map == ErrorMapState::PendingResponse {
                    n.producer_is_v5 = status.is_success();
                    n.error_map = ErrorMapState::Skip;
                    tracing::debug!(producer_is_v5 = n.producer_is_v5, "error map negotiated");
                }
                drop(n);
                self.handler.notify_paused();
                Ok(())
            }
            PeerResponse::Control { opaque, status } => {
                if !status.is_success() {
                    tracing::warn!(opaque, %status, "producer refused control");
                }
                Ok(())
            }
            PeerResponse::Noop { .. }
            | PeerResponse::SetVBucketState { .. }
            | PeerResponse::SnapshotMarker { .. } => Ok(()),
        }
    }

    /// The flusher persisted `vbid` up to `seqno`.
    pub fn seqno_persisted(&self, vbid: Vbid, seqno: u64) {
        if let Some(stream) = self.stream(vbid)
            && stream.seqno_persisted(seqno).is_some()
        {
            self.mark_ready(vbid);
        }
    }

    pub fn close_stream(&self, opaque: u32, vbid: Vbid) -> Result<(), DcpError> {
        let stream = self
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&vbid)
            .ok_or(DcpError::StreamNotFound { vbid })?;
        let freed = stream.set_dead(EndStreamReason::Closed);
        self.free(freed);
        lock(&self.buffered).remove(vbid);
        lock(&self.ready).remove(vbid);
        tracing::info!(parent: self.handler.span(), vb = %vbid, opaque, "passive stream closed");
        Ok(())
    }

    pub fn close_all_streams(&self, reason: EndStreamReason) {
        self.processor.cancel();
        let streams = std::mem::take(
            &mut *self
                .streams
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for stream in streams.values() {
            self.free(stream.set_dead(reason));
        }
        lock(&self.buffered).clear();
        lock(&self.ready).clear();
    }

    /// Drain one vbucket's buffer. Run by the buffer processor task.
    pub fn process_buffered_items(&self) -> ProcessOutcome {
        if self.handler.wants_disconnect() || self.processor.is_cancelled() {
            return ProcessOutcome::StopProcessing;
        }
        let _span = self.ctx.bucket.task_span("buffer_processor").entered();
        let Some(vbid) = lock(&self.buffered).pop() else {
            return ProcessOutcome::AllProcessed;
        };
        let Some(stream) = self.stream(vbid) else {
            return self.remaining_outcome();
        };

        let drained =
            stream.process_buffered_messages(&self.ctx, self.ctx.limits.processor_batch_bytes);
        self.free(stream.take_discarded_bytes());
        if stream.has_ready() {
            self.mark_ready(vbid);
        }
        let (result, freed) = match drained {
            Ok(drained) => drained,
            Err(err) => {
                tracing::error!(vb = %vbid, error = %err, "buffered message failed; stream closed");
                self.handler.notify_paused();
                return self.remaining_outcome();
            }
        };
        self.free(freed);

        match result {
            ProcessResult::AllProcessed => {
                tracing::debug!(vb = %vbid, freed, "stream buffer drained");
                self.handler.notify_paused();
                self.remaining_outcome()
            }
            ProcessResult::MoreToProcess => {
                lock(&self.buffered).push(vbid);
                ProcessOutcome::MoreToProcess
            }
            ProcessResult::CannotProcess => {
                lock(&self.buffered).push(vbid);
                self.backoffs.fetch_add(1, Ordering::Relaxed);
                metrics::consumer_backoff();
                ProcessOutcome::CannotProcess
            }
        }
    }

    /// Drain every buffer inline until done or blocked; for hosts without a
    /// task pool.
    pub fn drain_buffers(&self) -> ProcessOutcome {
        loop {
            match self.process_buffered_items() {
                ProcessOutcome::MoreToProcess => continue,
                other => return other,
            }
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        let (received_bytes, freed_bytes) = {
            let flow = lock(&self.flow);
            (flow.received_bytes(), flow.freed_total())
        };
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        ConsumerStats {
            streams: streams.len(),
            buffered_messages: streams.values().map(|s| s.buffered_messages()).sum(),
            buffered_bytes: streams.values().map(|s| s.buffered_bytes()).sum(),
            items_applied: streams.values().map(|s| s.items_applied()).sum(),
            backoffs: self.backoffs(),
            received_bytes,
            freed_bytes,
        }
    }

    fn remaining_outcome(&self) -> ProcessOutcome {
        if lock(&self.buffered).is_empty() {
            ProcessOutcome::AllProcessed
        } else {
            ProcessOutcome::MoreToProcess
        }
    }

    fn message_received(&self, opaque: u32, vbid: Vbid, msg: DcpResponse) -> Result<(), DcpError> {
        let _enter = self.handler.span().enter();
        self.touch();
        if self.new_data_refused.load(Ordering::Acquire) {
            return Err(DcpError::Disconnect);
        }
        let stream = self.stream_for(opaque, vbid)?;
        let size = msg.message_size();
        lock(&self.flow).note_received(size);

        let result = stream.message_received(&self.ctx, msg);
        self.free(stream.take_discarded_bytes());
        if stream.has_ready() {
            self.mark_ready(vbid);
        }
        match result {
            Ok(()) => {
                self.free(size);
                Ok(())
            }
            Err(DcpError::Backpressure { vbid }) => {
                tracing::debug!(vb = %vbid, size, "message buffered");
                lock(&self.buffered).push(vbid);
                self.processor.notify();
                Err(DcpError::Backpressure { vbid })
            }
            Err(DcpError::Disconnect) => {
                if self.ctx.replication.full_policy == FullPolicy::FailNewData {
                    self.new_data_refused.store(true, Ordering::Release);
                }
                self.handler.set_disconnect();
                Err(DcpError::Disconnect)
            }
            Err(err) => {
                self.free(size);
                Err(err)
            }
        }
    }

    fn stream_for(&self, opaque: u32, vbid: Vbid) -> Result<Arc<PassiveStream>, DcpError> {
        let stream = self
            .stream(vbid)
            .ok_or(DcpError::StreamNotFound { vbid })?;
        if stream.opaque() != opaque {
            return Err(DcpError::OpaqueMismatch {
                vbid,
                expected: stream.opaque(),
                got: opaque,
            });
        }
        Ok(stream)
    }

    fn stream_by_opaque(&self, opaque: u32) -> Option<Arc<PassiveStream>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|s| s.opaque() == opaque)
            .cloned()
    }

    fn touch(&self) {
        self.last_message_ms
            .store(self.ctx.now_ms(), Ordering::Release);
    }

    fn free(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let mut flow = lock(&self.flow);
        flow.note_freed(bytes);
        let due = flow.ack_due(self.ctx.now_ms());
        drop(flow);
        if due {
            self.handler.notify_paused();
        }
    }

    fn mark_ready(&self, vbid: Vbid) {
        lock(&self.ready).push(vbid);
        self.handler.notify_paused();
    }

    fn next_from_streams(&self) -> Option<DcpResponse> {
        let candidates = lock(&self.ready).len();
        for _ in 0..candidates {
            let Some(vbid) = lock(&self.ready).pop() else {
                break;
            };
            let Some(stream) = self.stream(vbid) else {
                continue;
            };
            if let Some(msg) = stream.next() {
                if stream.has_ready() {
                    lock(&self.ready).push(vbid);
                }
                return Some(msg);
            }
        }
        None
    }
}

impl std::fmt::Debug for DcpConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpConsumer")
            .field("handler", &self.handler)
            .field("vbuckets", &self.vbuckets())
            .finish()
    }
}
