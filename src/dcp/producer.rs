//! Producer connection: serves active streams to one peer.
//!
//! `step` is called by the thread servicing the connection's socket and
//! pulls one message at a time, round robin over the vbuckets that have
//! something to send. Cursor pulls and disk backfills run on the task pool;
//! they fill stream ready queues and then wake the connection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use crate::core::{Cookie, FailoverEntry, ResumeRequest, VBucketState, Vbid};
use crate::metrics;

use super::connection::{ConnHandler, ConnKind, Step};
use super::context::EngineContext;
use super::error::DcpError;
use super::flow_control::BufferLog;
use super::message::{DcpResponse, EndStreamReason, PeerResponse, stream_flags};
use super::noop::{NoopContext, NoopDecision};
use super::ready_queue::VbReadyList;
use super::sink::{MessageSink, SinkError};
use super::stream::{
    ActiveStream, BackfillProgress, ResponseOptions, StreamPoll, StreamRequest,
};
use super::task::{Task, TaskHandle, TaskOutcome};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub items_sent: u64,
    pub bytes_sent: u64,
    pub items_remaining: usize,
    pub backfill_items: u64,
    pub streams: usize,
    pub flow_control_outstanding: usize,
    pub priority: &'static str,
    pub ext_metadata: bool,
    pub supports_cursor_dropping: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Session parameters negotiated through `control`.
#[derive(Debug)]
struct Settings {
    options: ResponseOptions,
    compression_negotiated: bool,
    send_stream_end_on_close: bool,
    supports_cursor_dropping: bool,
    ext_metadata: bool,
    sync_replication: bool,
    priority: Priority,
    consumer_name: Option<String>,
}

#[derive(Debug)]
struct Session {
    settings: Settings,
    noop: NoopContext,
    buffer_log: BufferLog,
}

pub struct DcpProducer {
    handler: ConnHandler,
    ctx: Arc<EngineContext>,
    session: Mutex<Session>,
    streams: RwLock<BTreeMap<Vbid, Arc<ActiveStream>>>,
    ready: Mutex<VbReadyList>,
    checkpoint_queue: Mutex<VbReadyList>,
    backfill_queue: Mutex<VbReadyList>,
    checkpoint_task: TaskHandle,
    backfill_task: TaskHandle,
    items_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

struct CheckpointProcessorTask {
    producer: Weak<DcpProducer>,
}

impl Task for CheckpointProcessorTask {
    fn name(&self) -> &'static str {
        "checkpoint_processor"
    }

    fn run(&self) -> TaskOutcome {
        match self.producer.upgrade() {
            Some(producer) => producer.run_checkpoint_processor(),
            None => TaskOutcome::Done,
        }
    }
}

struct BackfillTask {
    producer: Weak<DcpProducer>,
}

impl Task for BackfillTask {
    fn name(&self) -> &'static str {
        "backfill"
    }

    fn run(&self) -> TaskOutcome {
        match self.producer.upgrade() {
            Some(producer) => producer.run_backfills(),
            None => TaskOutcome::Done,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, DcpError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DcpError::invalid(format!(
            "{key} expects true or false, got `{value}`"
        ))),
    }
}

impl DcpProducer {
    pub fn new(
        ctx: Arc<EngineContext>,
        cookie: Cookie,
        name: impl Into<String>,
        flags: u32,
    ) -> Arc<Self> {
        let name = name.into();
        let span = ctx.bucket.connection_span(ConnKind::Producer.as_str(), &name);
        let now = ctx.now_ms();
        Arc::new_cyclic(|weak: &Weak<DcpProducer>| {
            let checkpoint: Arc<dyn Task> = Arc::new(CheckpointProcessorTask {
                producer: weak.clone(),
            });
            let backfill: Arc<dyn Task> = Arc::new(BackfillTask {
                producer: weak.clone(),
            });
            let (checkpoint_task, backfill_task) = match &ctx.tasks {
                Some(pool) => (pool.register(checkpoint), pool.register(backfill)),
                None => (
                    TaskHandle::detached(checkpoint),
                    TaskHandle::detached(backfill),
                ),
            };
            tracing::info!(parent: &span, flags, "producer opened");
            DcpProducer {
                handler: ConnHandler::new(
                    cookie,
                    name,
                    ConnKind::Producer,
                    span,
                    Arc::clone(&ctx.pending),
                ),
                session: Mutex::new(Session {
                    settings: Settings {
                        options: ResponseOptions::from_open_flags(flags),
                        compression_negotiated: false,
                        send_stream_end_on_close: false,
                        supports_cursor_dropping: false,
                        ext_metadata: false,
                        sync_replication: false,
                        priority: Priority::Medium,
                        consumer_name: None,
                    },
                    noop: NoopContext::new(&ctx.limits, now),
                    buffer_log: BufferLog::new(),
                }),
                streams: RwLock::new(BTreeMap::new()),
                ready: Mutex::new(VbReadyList::new()),
                checkpoint_queue: Mutex::new(VbReadyList::new()),
                backfill_queue: Mutex::new(VbReadyList::new()),
                checkpoint_task,
                backfill_task,
                items_sent: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
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

    pub fn cookie(&self) -> Cookie {
        self.handler.cookie()
    }

    pub fn stream(&self, vbid: Vbid) -> Option<Arc<ActiveStream>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&vbid)
            .cloned()
    }

    pub fn stream_count(&self) -> usize {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Value compression was agreed during HELLO.
    pub fn set_compression(&self, enabled: bool) {
        let mut session = lock(&self.session);
        session.settings.compression_negotiated = enabled;
        session.settings.options.compression = enabled;
        if !enabled {
            session.settings.options.force_compression = false;
        }
    }

    pub fn noop_enabled(&self) -> bool {
        lock(&self.session).noop.is_enabled()
    }

    pub fn noop_interval_ms(&self) -> u64 {
        lock(&self.session).noop.interval_ms()
    }

    pub fn sync_replication_enabled(&self) -> bool {
        lock(&self.session).settings.sync_replication
    }

    pub fn consumer_name(&self) -> Option<String> {
        lock(&self.session).settings.consumer_name.clone()
    }

    /// Pull the next message for the peer.
    pub fn step(&self, sink: &mut dyn MessageSink) -> Result<Step, DcpError> {
        let _enter = self.handler.span().enter();
        if self.handler.wants_disconnect() {
            return Err(DcpError::Disconnect);
        }
        self.handler.unpause();

        if let Some(msg) = self.handler.take_rejected() {
            return self.send(sink, msg);
        }

        let now = self.ctx.now_ms();
        self.maybe_disconnect(now)?;
        if let Some(step) = self.maybe_send_noop(sink, now)? {
            return Ok(step);
        }

        if lock(&self.session).buffer_log.is_full() {
            tracing::trace!("flow control window full");
            self.handler.pause();
            return Ok(Step::WouldBlock);
        }

        if let Some(msg) = self.next_from_streams() {
            return self.send(sink, msg);
        }

        self.handler.pause();
        // A stream may have become ready between the scan and the pause.
        if !lock(&self.ready).is_empty() {
            self.handler.notify_paused();
        }
        Ok(Step::WouldBlock)
    }

    /// Disconnect signal once a noop has gone unanswered past the idle timeout.
    pub fn maybe_disconnect(&self, now_ms: u64) -> Result<(), DcpError> {
        let session = lock(&self.session);
        if session.noop.should_disconnect(now_ms) {
            tracing::warn!(
                last_receive_ms = session.noop.last_receive_ms(),
                now_ms,
                "noop unanswered past idle timeout; disconnecting"
            );
            drop(session);
            self.handler.set_disconnect();
            return Err(DcpError::Disconnect);
        }
        Ok(())
    }

    /// Send a noop if one is due. `Ok(None)` means no message was produced.
    pub fn maybe_send_noop(
        &self,
        sink: &mut dyn MessageSink,
        now_ms: u64,
    ) -> Result<Option<Step>, DcpError> {
        let opaque = {
            let session = lock(&self.session);
            match session.noop.poll(now_ms) {
                NoopDecision::Send => session.noop.opaque(),
                NoopDecision::Pending | NoopDecision::NotDue => return Ok(None),
            }
        };
        match sink.send(&DcpResponse::Noop { opaque }) {
            Ok(()) => {
                lock(&self.session).noop.mark_sent(now_ms);
                tracing::trace!(opaque, "noop sent");
                Ok(Some(Step::Sent))
            }
            Err(SinkError::WouldBlock) => Ok(Some(Step::WouldBlock)),
            Err(SinkError::TooBig) => Err(DcpError::TooBig),
            Err(SinkError::Disconnected) => {
                self.handler.set_disconnect();
                Err(DcpError::Disconnect)
            }
        }
    }

    /// Directory sweep: enforce the idle deadline and wake us for a due noop.
    pub fn check_liveness(&self, now_ms: u64) {
        let session = lock(&self.session);
        if session.noop.should_disconnect(now_ms) {
            drop(session);
            tracing::warn!(parent: self.handler.span(), "producer idle past timeout");
            self.handler.set_disconnect();
            return;
        }
        let due = session.noop.poll(now_ms) == NoopDecision::Send;
        drop(session);
        if due {
            self.handler.notify_paused();
        }
    }

    pub fn stream_req(&self, req: StreamRequest) -> Result<Vec<FailoverEntry>, DcpError> {
        let _enter = self.handler.span().enter();
        self.note_activity();
        let vbid = req.vbid;
        let info = self
            .ctx
            .vbuckets()
            .info(vbid)
            .ok_or(DcpError::NotMyVbucket { vbid })?;
        if req.has_flag(stream_flags::ACTIVE_VB_ONLY) && info.state != VBucketState::Active {
            return Err(DcpError::NotMyVbucket { vbid });
        }
        if info.receiving_initial_disk_snapshot {
            tracing::debug!(vb = %vbid, "stream request during initial disk snapshot");
            return Err(DcpError::TempFail);
        }
        // Check and insert under one guard: at most one live stream per vbucket.
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        if streams.get(&vbid).is_some_and(|s| !s.is_dead()) {
            return Err(DcpError::StreamExists { vbid });
        }

        let mut req = req;
        if req.has_flag(stream_flags::TO_LATEST) {
            req.end_seqno = info.high_seqno;
        }
        if req.start_seqno > req.end_seqno {
            return Err(DcpError::invalid(format!(
                "start seqno {} is after end seqno {}",
                req.start_seqno, req.end_seqno
            )));
        }
        if req.snap_start > req.start_seqno || req.start_seqno > req.snap_end {
            return Err(DcpError::invalid(format!(
                "snapshot {}..={} does not contain start seqno {}",
                req.snap_start, req.snap_end, req.start_seqno
            )));
        }

        let table = self
            .ctx
            .failover()
            .table(vbid)
            .ok_or(DcpError::NotMyVbucket { vbid })?;
        let resume = ResumeRequest {
            start_seqno: req.start_seqno,
            vb_uuid: req.vb_uuid,
            snap_start: req.snap_start,
            snap_end: req.snap_end,
        };
        if let Some(seqno) = table.needs_rollback(&resume, info.high_seqno, info.purge_seqno) {
            tracing::info!(
                vb = %vbid,
                start = req.start_seqno,
                vb_uuid = req.vb_uuid,
                rollback = seqno,
                "stream request needs rollback"
            );
            return Err(DcpError::Rollback { seqno });
        }

        let stream = Arc::new(ActiveStream::new(
            self.name(),
            req,
            self.ctx.limits.ready_queue_max_bytes,
        ));
        let backfill = stream.activate(Arc::clone(&self.ctx.stores.checkpoints))?;
        streams.insert(vbid, Arc::clone(&stream));
        drop(streams);
        tracing::info!(
            vb = %vbid,
            opaque = req.opaque,
            start = req.start_seqno,
            end = req.end_seqno,
            backfill = ?backfill,
            "stream created"
        );

        if backfill.is_some() {
            lock(&self.backfill_queue).push(vbid);
            self.backfill_task.notify();
        }
        self.mark_ready(vbid);
        Ok(table.entries().copied().collect())
    }

    pub fn get_failover_log(&self, vbid: Vbid) -> Result<Vec<FailoverEntry>, DcpError> {
        self.note_activity();
        let table = self
            .ctx
            .failover()
            .table(vbid)
            .ok_or(DcpError::NotMyVbucket { vbid })?;
        Ok(table.entries().copied().collect())
    }

    pub fn close_stream(&self, opaque: u32, vbid: Vbid) -> Result<(), DcpError> {
        self.note_activity();
        let Some(stream) = self.stream(vbid) else {
            return Err(DcpError::StreamNotFound { vbid });
        };
        let send_end = lock(&self.session).settings.send_stream_end_on_close;
        if send_end {
            if !stream.set_dead(EndStreamReason::Closed, true) {
                return Err(DcpError::StreamNotFound { vbid });
            }
            self.mark_ready(vbid);
        } else {
            self.remove_stream(vbid, &stream);
            stream.set_dead(EndStreamReason::Closed, false);
        }
        tracing::info!(vb = %vbid, opaque, send_end, "stream close requested");
        Ok(())
    }

    pub fn buffer_acknowledgement(&self, vbid: Vbid, bytes: u32) -> Result<(), DcpError> {
        self.note_activity();
        let reopened = lock(&self.session).buffer_log.acknowledge(bytes as usize);
        tracing::trace!(vb = %vbid, bytes, reopened, "buffer acknowledged");
        if reopened {
            self.handler.notify_paused();
        }
        Ok(())
    }

    /// Negotiate a named session parameter.
    pub fn control(&self, key: &str, value: &str) -> Result<(), DcpError> {
        self.note_activity();
        let mut session = lock(&self.session);
        match key {
            "connection_buffer_size" | "stream_buffer_size" => {
                let bytes = value.parse::<usize>().map_err(|_| {
                    DcpError::invalid(format!("{key} expects a byte count, got `{value}`"))
                })?;
                session.buffer_log.set_buffer_size(bytes);
            }
            "enable_noop" => {
                let enabled = parse_bool(key, value)?;
                session.noop.set_enabled(enabled);
            }
            "set_noop_interval" => {
                let secs = value.parse::<u64>().map_err(|_| {
                    DcpError::invalid(format!("{key} expects seconds, got `{value}`"))
                })?;
                let interval_ms = secs.saturating_mul(1_000);
                let sweep_ms = self.ctx.limits.connection_manager_interval_ms.max(1);
                if interval_ms == 0 || interval_ms % sweep_ms != 0 {
                    return Err(DcpError::invalid(format!(
                        "noop interval {interval_ms}ms is not a multiple of {sweep_ms}ms"
                    )));
                }
                session.noop.set_interval_ms(interval_ms);
            }
            "set_priority" => {
                session.settings.priority = match value {
                    "high" => Priority::High,
                    "medium" => Priority::Medium,
                    "low" => Priority::Low,
                    _ => return Err(DcpError::invalid(format!("unknown priority `{value}`"))),
                };
            }
            "enable_ext_metadata" => {
                session.settings.ext_metadata = parse_bool(key, value)?;
            }
            "force_value_compression" => {
                let force = parse_bool(key, value)?;
                if force && !session.settings.compression_negotiated {
                    return Err(DcpError::invalid(
                        "force_value_compression requires value compression",
                    ));
                }
                session.settings.options.force_compression = force;
            }
            "supports_cursor_dropping" => {
                session.settings.supports_cursor_dropping = parse_bool(key, value)?;
            }
            "send_stream_end_on_client_close_stream" => {
                session.settings.send_stream_end_on_close = parse_bool(key, value)?;
            }
            "enable_expiry_opcode" => {
                session.settings.options.expiry_opcode = parse_bool(key, value)?;
            }
            "enable_sync_replication" => {
                session.settings.sync_replication = parse_bool(key, value)?;
            }
            "consumer_name" => {
                session.settings.consumer_name = Some(value.to_string());
            }
            _ => {
                return Err(DcpError::UnknownControl {
                    key: key.to_string(),
                });
            }
        }
        tracing::debug!(parent: self.handler.span(), key, value, "control accepted");
        Ok(())
    }

    /// The peer answered a request we sent.
    pub fn response_handler(&self, resp: &PeerResponse) -> Result<(), DcpError> {
        let now = self.ctx.now_ms();
        self.note_activity();
        match resp {
            PeerResponse::Noop { opaque, .. } => {
                let mut session = lock(&self.session);
                if *opaque == session.noop.opaque() {
                    session.noop.acknowledge(now);
                }
                Ok(())
            }
            PeerResponse::SetVBucketState { opaque, status } => {
                let stream = self
                    .streams
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .find(|s| s.opaque() == *opaque && !s.is_dead())
                    .cloned();
                let Some(stream) = stream else {
                    return Err(DcpError::invalid(format!(
                        "no takeover stream for opaque {opaque}"
                    )));
                };
                let vbid = stream.vbid();
                if !status.is_success() {
                    tracing::warn!(vb = %vbid, ?status, "takeover state change refused by peer");
                    stream.set_dead(EndStreamReason::State, true);
                } else {
                    stream.set_vbucket_state_ack(self.ctx.vbuckets())?;
                }
                self.mark_ready(vbid);
                Ok(())
            }
            PeerResponse::StreamRequest { .. }
            | PeerResponse::GetErrorMap { .. }
            | PeerResponse::Control { .. }
            | PeerResponse::SnapshotMarker { .. } => Ok(()),
        }
    }

    pub fn seqno_acknowledged(
        &self,
        vbid: Vbid,
        prepared: u64,
        persisted: u64,
    ) -> Result<(), DcpError> {
        self.note_activity();
        let stream = self
            .stream(vbid)
            .ok_or(DcpError::StreamNotFound { vbid })?;
        stream.seqno_acknowledged(prepared, persisted);
        Ok(())
    }

    /// New items were queued on `vbid`.
    pub fn notify_seqno_available(&self, vbid: Vbid, seqno: u64) {
        if let Some(stream) = self.stream(vbid)
            && stream.notify_seqno_available(seqno)
        {
            self.mark_ready(vbid);
        }
    }

    /// The vbucket left the active state; end its stream.
    pub fn vbucket_state_changed(&self, vbid: Vbid, state: VBucketState) {
        if state == VBucketState::Active {
            return;
        }
        if let Some(stream) = self.stream(vbid)
            && stream.set_dead(EndStreamReason::State, true)
        {
            self.mark_ready(vbid);
        }
    }

    pub fn close_all_streams(&self, reason: EndStreamReason) {
        self.checkpoint_task.cancel();
        self.backfill_task.cancel();
        let streams = std::mem::take(
            &mut *self
                .streams
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for stream in streams.values() {
            stream.set_dead(reason, false);
        }
        lock(&self.ready).clear();
        lock(&self.checkpoint_queue).clear();
        lock(&self.backfill_queue).clear();
        if !streams.is_empty() {
            tracing::info!(
                parent: self.handler.span(),
                streams = streams.len(),
                reason = reason.as_str(),
                "closed all streams"
            );
        }
    }

    /// Pull cursor batches for queued vbuckets. Run by the task pool.
    pub fn run_checkpoint_processor(&self) -> TaskOutcome {
        let _span = self.ctx.bucket.task_span("checkpoint_processor").entered();
        let options = lock(&self.session).settings.options;
        let max_items = self.ctx.limits.backfill_batch_items.max(1);
        for _ in 0..self.ctx.limits.checkpoint_processor_vbuckets_per_run.max(1) {
            let Some(vbid) = lock(&self.checkpoint_queue).pop() else {
                break;
            };
            let Some(stream) = self.stream(vbid) else {
                continue;
            };
            match stream.process_items(&options, max_items) {
                Ok(0) => {}
                Ok(_) => self.mark_ready(vbid),
                Err(err) => {
                    tracing::error!(vb = %vbid, error = %err, "checkpoint processing failed");
                    stream.set_dead(EndStreamReason::State, true);
                    self.mark_ready(vbid);
                }
            }
        }
        if lock(&self.checkpoint_queue).is_empty() {
            TaskOutcome::Done
        } else {
            TaskOutcome::Reschedule
        }
    }

    /// Advance queued disk backfills by one batch each. Run by the task pool.
    pub fn run_backfills(&self) -> TaskOutcome {
        let _span = self.ctx.bucket.task_span("backfill").entered();
        let options = lock(&self.session).settings.options;
        let batch = self.ctx.limits.backfill_batch_items.max(1);
        let queued = lock(&self.backfill_queue).len();
        for _ in 0..queued {
            let Some(vbid) = lock(&self.backfill_queue).pop() else {
                break;
            };
            let Some(stream) = self.stream(vbid) else {
                continue;
            };
            match stream.run_backfill(&options, batch) {
                Ok(BackfillProgress::More) => {
                    lock(&self.backfill_queue).push(vbid);
                }
                Ok(BackfillProgress::Done) => {}
                Ok(BackfillProgress::Full) => {
                    tracing::trace!(vb = %vbid, "backfill paused on full ready queue");
                }
                Err(err) => {
                    tracing::error!(vb = %vbid, error = %err, "backfill failed");
                    stream.set_dead(EndStreamReason::BackfillFail, true);
                }
            }
            self.mark_ready(vbid);
        }
        if lock(&self.backfill_queue).is_empty() {
            TaskOutcome::Done
        } else {
            TaskOutcome::Reschedule
        }
    }

    /// Drive background work inline until there is none left; for hosts
    /// without a task pool.
    pub fn run_background_work(&self) {
        loop {
            let backfill = self.run_backfills();
            let checkpoint = self.run_checkpoint_processor();
            if backfill == TaskOutcome::Done && checkpoint == TaskOutcome::Done {
                break;
            }
        }
    }

    pub fn stats(&self) -> ProducerStats {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        let session = lock(&self.session);
        ProducerStats {
            items_sent: self.items_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            items_remaining: streams.values().map(|s| s.items_remaining()).sum(),
            backfill_items: streams.values().map(|s| s.backfill_items()).sum(),
            streams: streams.len(),
            flow_control_outstanding: session.buffer_log.outstanding(),
            priority: session.settings.priority.as_str(),
            ext_metadata: session.settings.ext_metadata,
            supports_cursor_dropping: session.settings.supports_cursor_dropping,
        }
    }

    fn note_activity(&self) {
        let now = self.ctx.now_ms();
        lock(&self.session).noop.note_recv(now);
    }

    fn mark_ready(&self, vbid: Vbid) {
        lock(&self.ready).push(vbid);
        self.handler.notify_paused();
    }

    fn schedule_checkpoint(&self, vbid: Vbid) {
        if lock(&self.checkpoint_queue).push(vbid) {
            self.checkpoint_task.notify();
        }
    }

    fn remove_stream(&self, vbid: Vbid, stream: &Arc<ActiveStream>) {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        if streams.get(&vbid).is_some_and(|s| Arc::ptr_eq(s, stream)) {
            streams.remove(&vbid);
        }
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
            match stream.next() {
                StreamPoll::Ready(msg) => {
                    if stream.resume_backfill() {
                        lock(&self.backfill_queue).push(vbid);
                        self.backfill_task.notify();
                    }
                    if matches!(msg, DcpResponse::StreamEnd { .. }) && stream.is_dead() {
                        self.remove_stream(vbid, &stream);
                    } else {
                        lock(&self.ready).push(vbid);
                    }
                    return Some(msg);
                }
                StreamPoll::NeedsProcessing => self.schedule_checkpoint(vbid),
                StreamPoll::Idle => {}
            }
        }
        None
    }

    fn send(&self, sink: &mut dyn MessageSink, msg: DcpResponse) -> Result<Step, DcpError> {
        let size = msg.message_size();
        let is_item = msg.item().is_some();
        let is_noop = matches!(msg, DcpResponse::Noop { .. });
        let step = self.handler.send(sink, msg)?;
        if step == Step::Sent {
            self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
            if is_item {
                self.items_sent.fetch_add(1, Ordering::Relaxed);
                metrics::items_sent(1);
            }
            if !is_noop {
                lock(&self.session).buffer_log.insert(size);
            }
        }
        Ok(step)
    }
}

impl std::fmt::Debug for DcpProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpProducer")
            .field("handler", &self.handler)
            .field("streams", &self.stream_count())
            .finish()
    }
}
