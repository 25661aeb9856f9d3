//! Consumer-side stream: apply what the producer sends, buffer what we can't.
//!
//! All application goes through the stream mutex, both for messages arriving
//! from the wire and for the background drain. A message that finds the
//! buffer non-empty joins the back of it, so items are always applied in the
//! order they were received.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::FullPolicy;
use crate::core::{FailoverEntry, Status, Vbid};
use crate::dcp::buffer::PassiveBuffer;
use crate::dcp::context::EngineContext;
use crate::dcp::durability::{DurabilityAcker, SeqnoAck};
use crate::dcp::error::DcpError;
use crate::dcp::message::{DcpResponse, EndStreamReason, SnapshotMarker};
use crate::dcp::store::StoreError;
use crate::metrics;

use super::{SeqnoWatermark, StreamState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    AllProcessed,
    MoreToProcess,
    /// Still over the memory threshold or the store refused; back off.
    CannotProcess,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SnapshotRange {
    start: u64,
    end: u64,
    ack: bool,
}

#[derive(Debug)]
struct PassiveInner {
    state: StreamState,
    buffer: PassiveBuffer,
    ready: VecDeque<DcpResponse>,
    last_received: SeqnoWatermark,
    received_snapshot: Option<SnapshotRange>,
    applied_snapshot: Option<SnapshotRange>,
    acker: DurabilityAcker,
    items_applied: u64,
    messages_buffered: u64,
    /// Received bytes thrown away by a kill, not yet handed back to flow control.
    discarded: usize,
}

#[derive(Debug)]
pub struct PassiveStream {
    vbid: Vbid,
    opaque: u32,
    caller_opaque: u32,
    flags: u32,
    name: String,
    inner: Mutex<PassiveInner>,
}

impl PassiveStream {
    /// Create the stream and queue its stream request, resuming from the
    /// vbucket's current high seqno.
    pub fn new(
        ctx: &EngineContext,
        name: impl Into<String>,
        opaque: u32,
        caller_opaque: u32,
        vbid: Vbid,
        flags: u32,
    ) -> Result<Self, DcpError> {
        let stream = Self {
            vbid,
            opaque,
            caller_opaque,
            flags,
            name: name.into(),
            inner: Mutex::new(PassiveInner {
                state: StreamState::Pending,
                buffer: PassiveBuffer::new(
                    ctx.limits.passive_buffer_max_items,
                    ctx.limits.passive_buffer_max_bytes,
                ),
                ready: VecDeque::new(),
                last_received: SeqnoWatermark::new(0),
                received_snapshot: None,
                applied_snapshot: None,
                acker: DurabilityAcker::new(),
                items_applied: 0,
                messages_buffered: 0,
                discarded: 0,
            }),
        };
        {
            let mut inner = stream.lock();
            stream.queue_stream_request(&mut inner, ctx)?;
        }
        Ok(stream)
    }

    fn lock(&self) -> MutexGuard<'_, PassiveInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn caller_opaque(&self) -> u32 {
        self.caller_opaque
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    pub fn is_dead(&self) -> bool {
        self.state().is_dead()
    }

    pub fn last_received_seqno(&self) -> u64 {
        self.lock().last_received.get()
    }

    pub fn buffered_messages(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.lock().buffer.bytes()
    }

    pub fn items_applied(&self) -> u64 {
        self.lock().items_applied
    }

    /// Messages that ever had to wait in the buffer.
    pub fn messages_buffered(&self) -> u64 {
        self.lock().messages_buffered
    }

    /// Bytes of received messages dropped since the last call.
    pub fn take_discarded_bytes(&self) -> usize {
        std::mem::take(&mut self.lock().discarded)
    }

    pub fn has_ready(&self) -> bool {
        !self.lock().ready.is_empty()
    }

    pub fn next(&self) -> Option<DcpResponse> {
        self.lock().ready.pop_front()
    }

    /// Put back a message the transport could not take.
    pub fn push_front_ready(&self, msg: DcpResponse) {
        self.lock().ready.push_front(msg);
    }

    /// The producer answered our stream request.
    pub fn accept_stream(
        &self,
        ctx: &EngineContext,
        status: Status,
        failover_log: Vec<FailoverEntry>,
    ) -> Result<(), DcpError> {
        let mut inner = self.lock();
        if inner.state != StreamState::Pending {
            return Err(DcpError::StreamNotFound { vbid: self.vbid });
        }
        if status.is_success() {
            ctx.failover().replace(self.vbid, failover_log)?;
            self.transition(&mut inner, StreamState::Reading);
        } else {
            tracing::warn!(vb = %self.vbid, ?status, "stream request rejected by producer");
            inner.discarded += self.kill_locked(&mut inner);
        }
        inner.ready.push_back(DcpResponse::AddStreamResponse {
            opaque: self.caller_opaque,
            stream_opaque: self.opaque,
            status,
        });
        Ok(())
    }

    /// The producer asked us to roll back; do it and ask again.
    pub fn rollback(&self, ctx: &EngineContext, seqno: u64) -> Result<u64, DcpError> {
        let mut inner = self.lock();
        if inner.state != StreamState::Pending {
            return Err(DcpError::StreamNotFound { vbid: self.vbid });
        }
        let high = ctx.vbuckets().rollback(self.vbid, seqno)?;
        ctx.failover().prune_after(self.vbid, high)?;
        tracing::info!(vb = %self.vbid, requested = seqno, high, "rolled back before re-requesting");
        inner.received_snapshot = None;
        inner.applied_snapshot = None;
        inner.discarded += inner.buffer.clear();
        self.queue_stream_request(&mut inner, ctx)?;
        Ok(high)
    }

    /// Handle one message from the producer.
    ///
    /// `Err(Backpressure)` means the message was kept in the stream buffer and
    /// will be applied by [`Self::process_buffered_messages`].
    pub fn message_received(&self, ctx: &EngineContext, msg: DcpResponse) -> Result<(), DcpError> {
        let mut inner = self.lock();
        if inner.state.is_dead() {
            return Err(DcpError::StreamNotFound { vbid: self.vbid });
        }

        match &msg {
            DcpResponse::SnapshotMarker(marker) => {
                inner.received_snapshot = Some(SnapshotRange {
                    start: marker.start_seqno,
                    end: marker.end_seqno,
                    ack: marker.wants_ack(),
                });
            }
            DcpResponse::StreamEnd { .. } => {}
            other => {
                let Some(seqno) = other.by_seqno() else {
                    return Err(DcpError::invalid(format!(
                        "{} is not a stream message",
                        other.kind()
                    )));
                };
                let (start, end) = inner
                    .received_snapshot
                    .map(|snap| (snap.start, snap.end))
                    .unwrap_or((0, 0));
                if seqno < start || seqno > end {
                    return Err(DcpError::OutOfRange {
                        vbid: self.vbid,
                        seqno,
                        start,
                        end,
                    });
                }
                if let Err(last) = inner.last_received.observe(seqno) {
                    tracing::error!(
                        vb = %self.vbid,
                        last,
                        seqno,
                        "producer sent a seqno behind the stream; killing stream"
                    );
                    metrics::sequence_invariant_violation(self.vbid);
                    inner.discarded += self.kill_locked(&mut inner);
                    return Err(DcpError::SequenceInvariant {
                        vbid: self.vbid,
                        last,
                        seqno,
                    });
                }
            }
        }

        let size = msg.message_size();
        let over = ctx.over_replication_threshold(size);
        if over && ctx.replication.full_policy == FullPolicy::FailNewData {
            tracing::warn!(
                vb = %self.vbid,
                mem_used = ctx.memory().mem_used(),
                "replication threshold reached; refusing new data"
            );
            return Err(DcpError::Disconnect);
        }
        if over || !inner.buffer.is_empty() {
            return self.buffer_locked(&mut inner, msg);
        }

        match self.apply_locked(&mut inner, ctx, &msg) {
            Ok(()) => Ok(()),
            Err(DcpError::Store(StoreError::TempFail { .. })) => self.buffer_locked(&mut inner, msg),
            Err(err) => {
                self.apply_failed_locked(&mut inner, &msg, &err);
                Err(err)
            }
        }
    }

    /// Drain the buffer in arrival order, up to `budget_bytes`.
    ///
    /// Returns the result and the number of bytes the drain freed. A message
    /// that fails to apply for any reason other than a store TempFail kills
    /// the stream; everything the drain freed or discarded is then left for
    /// [`Self::take_discarded_bytes`].
    pub fn process_buffered_messages(
        &self,
        ctx: &EngineContext,
        budget_bytes: usize,
    ) -> Result<(ProcessResult, usize), DcpError> {
        let mut freed = 0;
        loop {
            let mut inner = self.lock();
            if inner.state.is_dead() {
                freed += inner.buffer.clear();
                return Ok((ProcessResult::AllProcessed, freed));
            }
            let Some(size) = inner.buffer.front_size() else {
                return Ok((ProcessResult::AllProcessed, freed));
            };
            if freed > 0 && freed >= budget_bytes {
                return Ok((ProcessResult::MoreToProcess, freed));
            }
            if ctx.over_replication_threshold(size) {
                return Ok((ProcessResult::CannotProcess, freed));
            }
            let Some(msg) = inner.buffer.pop() else {
                return Ok((ProcessResult::AllProcessed, freed));
            };
            match self.apply_locked(&mut inner, ctx, &msg) {
                Ok(()) => freed += size,
                Err(DcpError::Store(StoreError::TempFail { .. })) => {
                    inner.buffer.push_front(msg);
                    return Ok((ProcessResult::CannotProcess, freed));
                }
                Err(err) => {
                    inner.discarded += freed + size;
                    self.apply_failed_locked(&mut inner, &msg, &err);
                    return Err(err);
                }
            }
        }
    }

    /// The flusher persisted the vbucket up to `seqno`.
    pub fn seqno_persisted(&self, seqno: u64) -> Option<SeqnoAck> {
        let mut inner = self.lock();
        if inner.state.is_dead() {
            return None;
        }
        let ack = inner.acker.persisted(seqno)?;
        self.queue_seqno_ack(&mut inner, ack);
        Some(ack)
    }

    /// Kill the stream; returns the buffered bytes that were discarded.
    pub fn set_dead(&self, reason: EndStreamReason) -> usize {
        let mut inner = self.lock();
        let earlier = std::mem::take(&mut inner.discarded);
        if inner.state.is_dead() {
            return earlier;
        }
        let freed = self.kill_locked(&mut inner) + earlier;
        tracing::info!(
            vb = %self.vbid,
            reason = reason.as_str(),
            discarded_bytes = freed,
            "passive stream closed"
        );
        freed
    }

    fn queue_stream_request(
        &self,
        inner: &mut PassiveInner,
        ctx: &EngineContext,
    ) -> Result<(), DcpError> {
        let info = ctx
            .vbuckets()
            .info(self.vbid)
            .ok_or(DcpError::NotMyVbucket { vbid: self.vbid })?;
        let vb_uuid = ctx
            .failover()
            .table(self.vbid)
            .and_then(|table| table.latest())
            .map(|entry| entry.vb_uuid)
            .unwrap_or(0);
        let high = info.high_seqno;
        inner.last_received.reset(high);
        inner.ready.push_back(DcpResponse::StreamRequest {
            opaque: self.opaque,
            vbid: self.vbid,
            flags: self.flags,
            start_seqno: high,
            end_seqno: u64::MAX,
            vb_uuid,
            snap_start: info.snap_start.min(high),
            snap_end: info.snap_end.max(high),
        });
        Ok(())
    }

    /// Move to Dead and drop the buffer; returns the bytes dropped.
    fn kill_locked(&self, inner: &mut PassiveInner) -> usize {
        let dropped = inner.buffer.clear();
        self.transition(inner, StreamState::Dead);
        dropped
    }

    /// The replica must never skip a seqno; an unappliable message kills the
    /// stream and the peer resumes from the failover log.
    fn apply_failed_locked(&self, inner: &mut PassiveInner, msg: &DcpResponse, err: &DcpError) {
        tracing::error!(
            vb = %self.vbid,
            kind = msg.kind(),
            seqno = ?msg.by_seqno(),
            error = %err,
            "failed to apply message; killing stream"
        );
        inner.discarded += self.kill_locked(inner);
    }

    fn buffer_locked(&self, inner: &mut PassiveInner, msg: DcpResponse) -> Result<(), DcpError> {
        if let Err(full) = inner.buffer.push(msg) {
            tracing::warn!(
                vb = %self.vbid,
                items = full.items,
                bytes = full.bytes,
                "passive buffer full; dropping connection"
            );
            return Err(DcpError::Disconnect);
        }
        inner.messages_buffered += 1;
        metrics::message_buffered(self.vbid);
        Err(DcpError::Backpressure { vbid: self.vbid })
    }

    fn apply_locked(
        &self,
        inner: &mut PassiveInner,
        ctx: &EngineContext,
        msg: &DcpResponse,
    ) -> Result<(), DcpError> {
        match msg {
            DcpResponse::SnapshotMarker(marker) => self.process_marker(inner, ctx, marker),
            DcpResponse::StreamEnd { reason, .. } => {
                self.transition(inner, StreamState::Dead);
                tracing::info!(vb = %self.vbid, reason = reason.as_str(), "producer ended stream");
                Ok(())
            }
            other => {
                let Some(item) = other.item() else {
                    return Err(DcpError::invalid("message carries no item"));
                };
                ctx.vbuckets().apply(item)?;
                inner.items_applied += 1;
                if matches!(other, DcpResponse::Prepare { .. })
                    && ctx.replication.enable_sync_replication
                    && let Some(ack) = inner.acker.prepare_received(item.by_seqno)
                {
                    self.queue_seqno_ack(inner, ack);
                }
                self.handle_snapshot_end(inner, ctx, item.by_seqno)
            }
        }
    }

    fn process_marker(
        &self,
        inner: &mut PassiveInner,
        ctx: &EngineContext,
        marker: &SnapshotMarker,
    ) -> Result<(), DcpError> {
        let store = ctx.vbuckets();
        let info = store
            .info(self.vbid)
            .ok_or(DcpError::NotMyVbucket { vbid: self.vbid })?;
        if marker.is_disk() {
            if ctx.replication.disk_backfill_queue {
                store.set_open_checkpoint_id(self.vbid, 0)?;
                store.set_backfill_phase(self.vbid, true)?;
            } else if info.high_seqno == 0 {
                store.set_receiving_initial_disk_snapshot(self.vbid, true)?;
            }
        } else if info.backfill_phase || info.open_checkpoint_id == 0 || marker.wants_checkpoint() {
            store.set_backfill_phase(self.vbid, false)?;
            let id = store.create_checkpoint(self.vbid)?;
            tracing::debug!(vb = %self.vbid, checkpoint = id, "memory snapshot opened checkpoint");
        }
        store.set_snapshot(self.vbid, marker.start_seqno, marker.end_seqno)?;
        inner.applied_snapshot = Some(SnapshotRange {
            start: marker.start_seqno,
            end: marker.end_seqno,
            ack: marker.wants_ack(),
        });
        Ok(())
    }

    fn handle_snapshot_end(
        &self,
        inner: &mut PassiveInner,
        ctx: &EngineContext,
        seqno: u64,
    ) -> Result<(), DcpError> {
        let Some(snapshot) = inner.applied_snapshot else {
            return Ok(());
        };
        if seqno < snapshot.end {
            return Ok(());
        }
        inner.applied_snapshot = None;
        let store = ctx.vbuckets();
        if store
            .info(self.vbid)
            .is_some_and(|info| info.receiving_initial_disk_snapshot)
        {
            store.set_receiving_initial_disk_snapshot(self.vbid, false)?;
        }
        if snapshot.ack {
            inner.ready.push_back(DcpResponse::SnapshotMarkerResponse {
                opaque: self.opaque,
                status: Status::Success,
            });
        }
        if ctx.replication.enable_sync_replication
            && let Some(ack) = inner.acker.snapshot_end()
        {
            self.queue_seqno_ack(inner, ack);
        }
        Ok(())
    }

    fn queue_seqno_ack(&self, inner: &mut PassiveInner, ack: SeqnoAck) {
        metrics::seqno_ack_emitted(self.vbid);
        inner.ready.push_back(DcpResponse::SeqnoAck {
            opaque: self.opaque,
            vbid: self.vbid,
            in_memory_seqno: ack.in_memory_seqno,
            on_disk_seqno: ack.on_disk_seqno,
        });
    }

    fn transition(&self, inner: &mut PassiveInner, next: StreamState) {
        if inner.state == next {
            return;
        }
        debug_assert!(
            inner.state.passive_can_move_to(next),
            "illegal passive stream transition {} -> {}",
            inner.state,
            next
        );
        inner.state = next;
    }
}
