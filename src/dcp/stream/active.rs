//! Producer-side stream: backfill from disk, then follow the checkpoint log.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::{VBucketState, Vbid};
use crate::dcp::cursor::CursorBridge;
use crate::dcp::error::DcpError;
use crate::dcp::message::{DcpResponse, EndStreamReason, SnapshotMarker, marker_flags, stream_flags};
use crate::dcp::ready_queue::ReadyQueue;
use crate::dcp::store::{CheckpointLog, StoreError, VBucketStore};
use crate::metrics;

use super::value::{ResponseOptions, make_response_from_item};
use super::{SeqnoWatermark, StreamState};

/// Parameters of a stream request, as received from the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub flags: u32,
    pub opaque: u32,
    pub vbid: Vbid,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub vb_uuid: u64,
    pub snap_start: u64,
    pub snap_end: u64,
}

impl StreamRequest {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug)]
pub enum StreamPoll {
    Ready(DcpResponse),
    /// In memory with nothing queued; the checkpoint processor should pull.
    NeedsProcessing,
    Idle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackfillProgress {
    More,
    Done,
    /// Ready queue is full; the backfill resumes once the queue drains.
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TakeoverPhase {
    None,
    PendingSent,
    ActiveSent,
}

#[derive(Debug)]
struct BackfillRange {
    start: u64,
    end: u64,
    next: u64,
    marker_sent: bool,
}

#[derive(Debug)]
struct ActiveInner {
    state: StreamState,
    ready: ReadyQueue,
    cursor: Option<CursorBridge>,
    backfill: Option<BackfillRange>,
    backfill_stalled: bool,
    last_read: SeqnoWatermark,
    last_sent: u64,
    items_ready: bool,
    takeover: TakeoverPhase,
    backfill_items: u64,
    memory_items: u64,
    peer_prepared: u64,
    peer_persisted: u64,
}

#[derive(Debug)]
pub struct ActiveStream {
    req: StreamRequest,
    name: String,
    inner: Mutex<ActiveInner>,
}

impl ActiveStream {
    pub fn new(name: impl Into<String>, req: StreamRequest, ready_queue_max_bytes: usize) -> Self {
        Self {
            req,
            name: name.into(),
            inner: Mutex::new(ActiveInner {
                state: StreamState::Pending,
                ready: ReadyQueue::new(ready_queue_max_bytes),
                cursor: None,
                backfill: None,
                backfill_stalled: false,
                last_read: SeqnoWatermark::new(req.start_seqno),
                last_sent: req.start_seqno,
                items_ready: false,
                takeover: TakeoverPhase::None,
                backfill_items: 0,
                memory_items: 0,
                peer_prepared: 0,
                peer_persisted: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ActiveInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn vbid(&self) -> Vbid {
        self.req.vbid
    }

    pub fn opaque(&self) -> u32 {
        self.req.opaque
    }

    pub fn request(&self) -> &StreamRequest {
        &self.req
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    pub fn is_dead(&self) -> bool {
        self.state().is_dead()
    }

    pub fn items_remaining(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn last_read_seqno(&self) -> u64 {
        self.lock().last_read.get()
    }

    pub fn last_sent_seqno(&self) -> u64 {
        self.lock().last_sent
    }

    pub fn backfill_items(&self) -> u64 {
        self.lock().backfill_items
    }

    pub fn memory_items(&self) -> u64 {
        self.lock().memory_items
    }

    /// Latest (prepared, persisted) seqnos the peer acknowledged.
    pub fn peer_acks(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.peer_prepared, inner.peer_persisted)
    }

    /// Place the cursor. Returns the range to backfill from disk, if any.
    pub fn activate(&self, log: Arc<dyn CheckpointLog>) -> Result<Option<(u64, u64)>, DcpError> {
        let mut inner = self.lock();
        if inner.state != StreamState::Pending {
            return Ok(None);
        }
        let (cursor, backfill) =
            CursorBridge::register(log, &self.name, self.req.vbid, self.req.start_seqno)
                .map_err(|err| match err {
                    StoreError::RollbackRequired { seqno } => DcpError::Rollback { seqno },
                    other => DcpError::Store(other),
                })?;
        inner.cursor = Some(cursor);

        if let Some((start, end)) = backfill {
            let end = end.min(self.req.end_seqno);
            if start <= end {
                self.transition(&mut inner, StreamState::Backfilling);
                inner.backfill = Some(BackfillRange {
                    start,
                    end,
                    next: start,
                    marker_sent: false,
                });
                return Ok(Some((start, end)));
            }
        }

        if self.req.start_seqno >= self.req.end_seqno || self.req.has_flag(stream_flags::DISK_ONLY)
        {
            self.end_locked(&mut inner, EndStreamReason::Ok);
            return Ok(None);
        }
        self.transition(&mut inner, StreamState::InMemory);
        inner.items_ready = true;
        Ok(None)
    }

    /// Read the next batch of persisted items into the ready queue.
    pub fn run_backfill(
        &self,
        opts: &ResponseOptions,
        batch_items: usize,
    ) -> Result<BackfillProgress, DcpError> {
        let mut inner = self.lock();
        if inner.state != StreamState::Backfilling {
            return Ok(BackfillProgress::Done);
        }
        let Some(range) = inner.backfill.as_ref() else {
            return Ok(BackfillProgress::Done);
        };
        let (start, end, next, marker_sent) = (range.start, range.end, range.next, range.marker_sent);
        if !inner.ready.has_capacity() {
            inner.backfill_stalled = true;
            return Ok(BackfillProgress::Full);
        }
        let items = match inner.cursor.as_ref() {
            Some(cursor) => cursor.read_persisted(next, end, batch_items)?,
            None => Vec::new(),
        };

        if !items.is_empty() && !marker_sent {
            inner.ready.push(DcpResponse::SnapshotMarker(SnapshotMarker {
                opaque: self.req.opaque,
                vbid: self.req.vbid,
                start_seqno: start,
                end_seqno: end,
                flags: marker_flags::DISK | marker_flags::CHECKPOINT,
            }));
        }
        let fetched = items.len();
        let mut pushed = 0;
        let mut last = next.saturating_sub(1);
        for item in &items {
            if pushed > 0 && !inner.ready.has_capacity() {
                break;
            }
            self.observe_seqno(&mut inner, item.by_seqno)?;
            inner
                .ready
                .push(make_response_from_item(self.req.opaque, item, opts)?);
            last = item.by_seqno;
            pushed += 1;
        }
        inner.backfill_items += pushed as u64;
        if pushed > 0 {
            metrics::backfill_items(self.req.vbid, pushed as u64);
        }

        if let Some(range) = inner.backfill.as_mut() {
            range.marker_sent |= pushed > 0;
            range.next = last + 1;
        }
        if pushed < fetched {
            inner.backfill_stalled = true;
            return Ok(BackfillProgress::Full);
        }
        if fetched == batch_items.max(1) && last < end {
            return Ok(BackfillProgress::More);
        }

        inner.backfill = None;
        tracing::debug!(
            vb = %self.req.vbid,
            items = inner.backfill_items,
            "backfill complete"
        );
        if self.req.has_flag(stream_flags::DISK_ONLY) || inner.last_read.get() >= self.req.end_seqno
        {
            self.end_locked(&mut inner, EndStreamReason::Ok);
        } else {
            self.transition(&mut inner, StreamState::InMemory);
            inner.items_ready = true;
        }
        Ok(BackfillProgress::Done)
    }

    /// Clears a capacity stall once the ready queue has room again; true when
    /// the backfill should be rescheduled.
    pub fn resume_backfill(&self) -> bool {
        let mut inner = self.lock();
        if inner.backfill_stalled
            && inner.state == StreamState::Backfilling
            && inner.ready.has_capacity()
        {
            inner.backfill_stalled = false;
            return true;
        }
        false
    }

    /// Pull one cursor batch into the ready queue; returns messages queued.
    pub fn process_items(
        &self,
        opts: &ResponseOptions,
        max_items: usize,
    ) -> Result<usize, DcpError> {
        let mut inner = self.lock();
        if !matches!(inner.state, StreamState::InMemory | StreamState::TakeoverSend)
            || inner.takeover != TakeoverPhase::None
            || !inner.ready.has_capacity()
        {
            return Ok(0);
        }
        let batch = match inner.cursor.as_ref() {
            Some(cursor) => cursor.pull(max_items)?,
            None => return Ok(0),
        };

        if batch.is_empty() {
            if self.req.has_flag(stream_flags::TAKEOVER) {
                self.begin_takeover(&mut inner);
                return Ok(1);
            }
            return Ok(0);
        }

        let end_seqno = self.req.end_seqno;
        let mut flags = marker_flags::MEMORY;
        if batch.checkpoint_start {
            flags |= marker_flags::CHECKPOINT;
        }
        inner.ready.push(DcpResponse::SnapshotMarker(SnapshotMarker {
            opaque: self.req.opaque,
            vbid: self.req.vbid,
            start_seqno: batch.snap_start,
            end_seqno: batch.snap_end.min(end_seqno),
            flags,
        }));

        let mut queued = 1;
        for item in batch.items.iter().take_while(|item| item.by_seqno <= end_seqno) {
            self.observe_seqno(&mut inner, item.by_seqno)?;
            inner
                .ready
                .push(make_response_from_item(self.req.opaque, item, opts)?);
            inner.memory_items += 1;
            queued += 1;
        }
        if let Some(cursor) = inner.cursor.as_ref() {
            cursor.advance(batch.snap_end)?;
        }

        if inner.last_read.get() >= end_seqno {
            self.end_locked(&mut inner, EndStreamReason::Ok);
        } else if batch.items.len() >= max_items.max(1) || self.req.has_flag(stream_flags::TAKEOVER)
        {
            inner.items_ready = true;
        }
        Ok(queued)
    }

    /// Next message for the connection to send.
    pub fn next(&self) -> StreamPoll {
        let mut inner = self.lock();
        if let Some(msg) = inner.ready.pop() {
            if let Some(seqno) = msg.by_seqno() {
                inner.last_sent = seqno;
            }
            if matches!(msg, DcpResponse::SetVBucketState { .. }) {
                self.transition(&mut inner, StreamState::TakeoverWait);
            }
            return StreamPoll::Ready(msg);
        }
        match inner.state {
            StreamState::InMemory | StreamState::TakeoverSend if inner.items_ready => {
                inner.items_ready = false;
                StreamPoll::NeedsProcessing
            }
            _ => StreamPoll::Idle,
        }
    }

    /// New items exist for this vbucket. Returns true if the stream wants them.
    pub fn notify_seqno_available(&self, seqno: u64) -> bool {
        let mut inner = self.lock();
        let wants = matches!(inner.state, StreamState::InMemory | StreamState::TakeoverSend)
            && seqno > inner.last_read.get();
        if wants {
            inner.items_ready = true;
        }
        wants
    }

    /// The peer acknowledged one of our `SetVBucketState` messages.
    pub fn set_vbucket_state_ack(&self, store: &dyn VBucketStore) -> Result<(), DcpError> {
        let mut inner = self.lock();
        if inner.state != StreamState::TakeoverWait {
            tracing::warn!(
                vb = %self.req.vbid,
                state = %inner.state,
                "unexpected set_vbucket_state ack"
            );
            return Err(DcpError::invalid("stream is not waiting for a takeover ack"));
        }
        match inner.takeover {
            TakeoverPhase::PendingSent => {
                store.set_state(self.req.vbid, VBucketState::Dead)?;
                self.transition(&mut inner, StreamState::TakeoverSend);
                inner.takeover = TakeoverPhase::ActiveSent;
                inner.ready.push(DcpResponse::SetVBucketState {
                    opaque: self.req.opaque,
                    vbid: self.req.vbid,
                    state: VBucketState::Active,
                });
            }
            TakeoverPhase::ActiveSent => {
                tracing::info!(vb = %self.req.vbid, "takeover complete");
                self.end_locked(&mut inner, EndStreamReason::Ok);
            }
            TakeoverPhase::None => {
                return Err(DcpError::invalid("no takeover in progress"));
            }
        }
        Ok(())
    }

    pub fn seqno_acknowledged(&self, prepared: u64, persisted: u64) {
        let mut inner = self.lock();
        inner.peer_prepared = inner.peer_prepared.max(prepared);
        inner.peer_persisted = inner.peer_persisted.max(persisted);
    }

    /// Kill the stream. With `send_end` a `StreamEnd(reason)` is queued for
    /// the peer. Returns false if the stream was already dead.
    pub fn set_dead(&self, reason: EndStreamReason, send_end: bool) -> bool {
        let mut inner = self.lock();
        if inner.state.is_dead() {
            return false;
        }
        if reason != EndStreamReason::Ok {
            inner.ready.clear();
        }
        if send_end {
            self.end_locked(&mut inner, reason);
        } else {
            inner.cursor = None;
            inner.backfill = None;
            self.transition(&mut inner, StreamState::Dead);
            tracing::info!(vb = %self.req.vbid, reason = reason.as_str(), "stream closed");
        }
        true
    }

    fn begin_takeover(&self, inner: &mut ActiveInner) {
        self.transition(inner, StreamState::TakeoverSend);
        inner.takeover = TakeoverPhase::PendingSent;
        inner.ready.push(DcpResponse::SetVBucketState {
            opaque: self.req.opaque,
            vbid: self.req.vbid,
            state: VBucketState::Pending,
        });
    }

    fn observe_seqno(&self, inner: &mut ActiveInner, seqno: u64) -> Result<(), DcpError> {
        if let Err(last) = inner.last_read.observe(seqno) {
            tracing::error!(
                vb = %self.req.vbid,
                last,
                seqno,
                "checkpoint log returned a seqno behind the stream; killing stream"
            );
            metrics::sequence_invariant_violation(self.req.vbid);
            inner.ready.clear();
            inner.cursor = None;
            inner.backfill = None;
            self.transition(inner, StreamState::Dead);
            return Err(DcpError::SequenceInvariant {
                vbid: self.req.vbid,
                last,
                seqno,
            });
        }
        Ok(())
    }

    fn end_locked(&self, inner: &mut ActiveInner, reason: EndStreamReason) {
        inner.cursor = None;
        inner.backfill = None;
        inner.ready.push(DcpResponse::StreamEnd {
            opaque: self.req.opaque,
            vbid: self.req.vbid,
            reason,
        });
        self.transition(inner, StreamState::Dead);
        tracing::info!(
            vb = %self.req.vbid,
            reason = reason.as_str(),
            last_read = inner.last_read.get(),
            "stream ended"
        );
    }

    fn transition(&self, inner: &mut ActiveInner, next: StreamState) {
        if inner.state == next {
            return;
        }
        debug_assert!(
            inner.state.active_can_move_to(next),
            "illegal active stream transition {} -> {}",
            inner.state,
            next
        );
        tracing::debug!(vb = %self.req.vbid, from = %inner.state, to = %next, "stream transition");
        inner.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Limits;
    use crate::dcp::memory_bucket::MemoryBucket;

    const VB: Vbid = Vbid::new(0);

    fn request(start: u64, end: u64, flags: u32) -> StreamRequest {
        StreamRequest {
            flags,
            opaque: 9,
            vbid: VB,
            start_seqno: start,
            end_seqno: end,
            vb_uuid: 0,
            snap_start: start,
            snap_end: start,
        }
    }

    fn bucket_with(keys: &[&str]) -> Arc<MemoryBucket> {
        let bucket = Arc::new(MemoryBucket::default());
        bucket.create_vbucket(VB, VBucketState::Active);
        for key in keys {
            bucket.queue_mutation(VB, key.to_string(), "v").expect("queue");
        }
        bucket
    }

    fn drain(stream: &ActiveStream) -> Vec<DcpResponse> {
        let mut out = Vec::new();
        while let StreamPoll::Ready(msg) = stream.next() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn in_memory_stream_frames_items_with_marker() {
        let bucket = bucket_with(&["a", "b"]);
        let stream = ActiveStream::new("p", request(0, u64::MAX, 0), Limits::default().ready_queue_max_bytes);
        assert_eq!(stream.activate(bucket.clone()).expect("activate"), None);
        assert_eq!(stream.state(), StreamState::InMemory);
        assert!(matches!(stream.next(), StreamPoll::NeedsProcessing));

        let queued = stream
            .process_items(&ResponseOptions::default(), 10)
            .expect("process");
        assert_eq!(queued, 3);
        let msgs = drain(&stream);
        assert!(matches!(msgs[0], DcpResponse::SnapshotMarker(m) if m.is_memory()));
        assert_eq!(
            msgs.iter().filter_map(DcpResponse::by_seqno).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(stream.last_sent_seqno(), 2);
    }

    #[test]
    fn backfill_pauses_while_ready_queue_is_full() {
        let keys: Vec<String> = (0..40).map(|i| format!("k{i:02}")).collect();
        let bucket = Arc::new(MemoryBucket::default());
        bucket.create_vbucket(VB, VBucketState::Active);
        for key in &keys {
            bucket.queue_mutation(VB, key.clone(), "v").expect("queue");
        }
        bucket.persist(VB).expect("persist");
        bucket.create_new_checkpoint(VB).expect("checkpoint");
        bucket.remove_closed_checkpoints(VB).expect("remove");

        let stream = ActiveStream::new("p", request(0, 40, stream_flags::DISK_ONLY), 400);
        assert_eq!(stream.activate(bucket.clone()).expect("activate"), Some((1, 40)));
        let opts = ResponseOptions::default();

        let mut seqnos = Vec::new();
        let mut pauses = 0;
        loop {
            let progress = stream.run_backfill(&opts, 100).expect("backfill");
            assert!(stream.items_remaining() <= 10);
            assert!(!stream.resume_backfill());
            let msgs = drain(&stream);
            seqnos.extend(msgs.iter().filter_map(DcpResponse::by_seqno));
            match progress {
                BackfillProgress::Full => {
                    pauses += 1;
                    assert!(stream.resume_backfill());
                }
                BackfillProgress::More => {}
                BackfillProgress::Done => break,
            }
        }
        assert!(pauses > 0);
        assert_eq!(seqnos, (1..=40).collect::<Vec<_>>());
        assert_eq!(stream.backfill_items(), 40);
        assert!(stream.is_dead());
    }

    #[test]
    fn end_seqno_ends_stream_ok() {
        let bucket = bucket_with(&["a", "b", "c"]);
        let stream = ActiveStream::new("p", request(0, 2, 0), 1 << 20);
        stream.activate(bucket.clone()).expect("activate");
        stream
            .process_items(&ResponseOptions::default(), 10)
            .expect("process");
        let msgs = drain(&stream);
        assert!(matches!(
            msgs.last(),
            Some(DcpResponse::StreamEnd {
                reason: EndStreamReason::Ok,
                ..
            })
        ));
        assert_eq!(
            msgs.iter().filter_map(DcpResponse::by_seqno).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(stream.is_dead());
    }

    #[test]
    fn set_dead_is_idempotent_and_releases_cursor() {
        let bucket = bucket_with(&["a"]);
        let stream = ActiveStream::new("p", request(0, u64::MAX, 0), 1 << 20);
        stream.activate(bucket.clone()).expect("activate");
        assert!(stream.set_dead(EndStreamReason::Closed, true));
        assert!(!stream.set_dead(EndStreamReason::Closed, true));
        let msgs = drain(&stream);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(
            msgs[0],
            DcpResponse::StreamEnd {
                reason: EndStreamReason::Closed,
                ..
            }
        ));
        assert_eq!(
            stream.process_items(&ResponseOptions::default(), 10).expect("process"),
            0
        );
    }

    #[test]
    fn takeover_hands_vbucket_over_in_two_acks() {
        let bucket = bucket_with(&["a"]);
        let stream = ActiveStream::new(
            "p",
            request(0, u64::MAX, stream_flags::TAKEOVER),
            1 << 20,
        );
        stream.activate(bucket.clone()).expect("activate");
        let opts = ResponseOptions::default();
        stream.process_items(&opts, 10).expect("items");
        assert!(matches!(stream.next(), StreamPoll::Ready(DcpResponse::SnapshotMarker(_))));
        assert!(matches!(stream.next(), StreamPoll::Ready(DcpResponse::Mutation { .. })));

        // caught up: the next pull starts the handover
        assert!(matches!(stream.next(), StreamPoll::NeedsProcessing));
        assert_eq!(stream.process_items(&opts, 10).expect("catch up"), 1);
        assert!(matches!(
            stream.next(),
            StreamPoll::Ready(DcpResponse::SetVBucketState {
                state: VBucketState::Pending,
                ..
            })
        ));
        assert_eq!(stream.state(), StreamState::TakeoverWait);

        stream.set_vbucket_state_ack(bucket.as_ref()).expect("ack pending");
        assert_eq!(bucket.info(VB).map(|i| i.state), Some(VBucketState::Dead));
        assert!(matches!(
            stream.next(),
            StreamPoll::Ready(DcpResponse::SetVBucketState {
                state: VBucketState::Active,
                ..
            })
        ));
        stream.set_vbucket_state_ack(bucket.as_ref()).expect("ack active");
        assert!(matches!(
            stream.next(),
            StreamPoll::Ready(DcpResponse::StreamEnd {
                reason: EndStreamReason::Ok,
                ..
            })
        ));
        assert!(stream.is_dead());
    }
}
