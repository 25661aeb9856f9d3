//! In-memory bucket: checkpoint log, replica store and failover log in one.
//!
//! Hosts use it to embed the engine without a storage backend and tests use
//! it to drive producers and consumers end to end. Items live in a per-vbucket
//! log split into checkpoints; `persist` copies them to a "disk" map that
//! backfills read from once `remove_closed_checkpoints` has evicted them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;

use crate::core::{FailoverEntry, FailoverTable, Item, Limits, VBucketState, Vbid};

use super::memory::MemoryTracker;
use super::store::{
    Batch, CheckpointLog, CursorId, CursorRegistration, FailoverLog, StoreError, VBucketInfo,
    VBucketStore,
};

#[derive(Clone, Copy, Debug)]
struct Checkpoint {
    id: u64,
    start_seqno: u64,
}

#[derive(Debug)]
struct VBucketData {
    state: VBucketState,
    log: Vec<Arc<Item>>,
    checkpoints: Vec<Checkpoint>,
    disk: BTreeMap<u64, Arc<Item>>,
    docs: HashMap<Bytes, Arc<Item>>,
    high_seqno: u64,
    purge_seqno: u64,
    persisted_seqno: u64,
    snap_start: u64,
    snap_end: u64,
    backfill_phase: bool,
    receiving_initial_disk_snapshot: bool,
    failover: FailoverTable,
    applied: Vec<u64>,
}

impl VBucketData {
    fn new(state: VBucketState, failover_max: usize) -> Self {
        Self {
            state,
            log: Vec::new(),
            checkpoints: vec![Checkpoint {
                id: 1,
                start_seqno: 1,
            }],
            disk: BTreeMap::new(),
            docs: HashMap::new(),
            high_seqno: 0,
            purge_seqno: 0,
            persisted_seqno: 0,
            snap_start: 0,
            snap_end: 0,
            backfill_phase: false,
            receiving_initial_disk_snapshot: false,
            failover: FailoverTable::new(failover_max),
            applied: Vec::new(),
        }
    }

    fn open_checkpoint(&self) -> Checkpoint {
        self.checkpoints.last().copied().unwrap_or(Checkpoint {
            id: 0,
            start_seqno: self.high_seqno + 1,
        })
    }

    fn info(&self) -> VBucketInfo {
        VBucketInfo {
            state: self.state,
            high_seqno: self.high_seqno,
            purge_seqno: self.purge_seqno,
            persisted_seqno: self.persisted_seqno,
            snap_start: self.snap_start,
            snap_end: self.snap_end,
            open_checkpoint_id: self.open_checkpoint().id,
            backfill_phase: self.backfill_phase,
            receiving_initial_disk_snapshot: self.receiving_initial_disk_snapshot,
        }
    }

    fn create_checkpoint(&mut self) -> u64 {
        let id = self.open_checkpoint().id + 1;
        self.checkpoints.push(Checkpoint {
            id,
            start_seqno: self.high_seqno + 1,
        });
        id
    }

    /// Lowest seqno still held in memory.
    fn mem_low_seqno(&self) -> u64 {
        self.log
            .first()
            .map(|item| item.by_seqno)
            .unwrap_or(self.high_seqno + 1)
    }

    fn push(&mut self, item: Arc<Item>) {
        self.high_seqno = self.high_seqno.max(item.by_seqno);
        self.docs.insert(item.key.clone(), Arc::clone(&item));
        self.log.push(item);
    }
}

#[derive(Debug)]
struct CursorState {
    vbid: Vbid,
    position: u64,
}

#[derive(Debug, Default)]
struct BucketState {
    vbuckets: BTreeMap<Vbid, VBucketData>,
    cursors: HashMap<CursorId, CursorState>,
    next_cursor: u64,
    fail_applies: usize,
    reject_seqno: Option<u64>,
}

#[derive(Debug)]
pub struct MemoryBucket {
    state: RwLock<BucketState>,
    memory: Arc<MemoryTracker>,
    failover_max: usize,
}

impl Default for MemoryBucket {
    fn default() -> Self {
        Self::new(Arc::new(MemoryTracker::new(0)), &Limits::default())
    }
}

impl MemoryBucket {
    pub fn new(memory: Arc<MemoryTracker>, limits: &Limits) -> Self {
        Self {
            state: RwLock::new(BucketState::default()),
            memory,
            failover_max: limits.failover_log_max_entries,
        }
    }

    pub fn memory(&self) -> Arc<MemoryTracker> {
        Arc::clone(&self.memory)
    }

    fn read(&self) -> RwLockReadGuard<'_, BucketState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BucketState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_vbucket(&self, vbid: Vbid, state: VBucketState) {
        let mut guard = self.write();
        guard
            .vbuckets
            .entry(vbid)
            .or_insert_with(|| VBucketData::new(state, self.failover_max));
    }

    /// Queue a locally originated change; the bucket assigns its seqno.
    pub fn queue_item(&self, mut item: Item) -> Result<u64, StoreError> {
        let vbid = item.vbid;
        let mut guard = self.write();
        let vb = guard
            .vbuckets
            .get_mut(&vbid)
            .ok_or(StoreError::NoSuchVbucket { vbid })?;
        item.by_seqno = vb.high_seqno + 1;
        let seqno = item.by_seqno;
        self.memory.charge(item.size());
        vb.push(Arc::new(item));
        Ok(seqno)
    }

    pub fn queue_mutation(
        &self,
        vbid: Vbid,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<u64, StoreError> {
        self.queue_item(Item::mutation(vbid, key, value, 0))
    }

    /// Flush everything queued so far; returns the persisted seqno.
    pub fn persist(&self, vbid: Vbid) -> Result<u64, StoreError> {
        let mut guard = self.write();
        let vb = guard
            .vbuckets
            .get_mut(&vbid)
            .ok_or(StoreError::NoSuchVbucket { vbid })?;
        let from = vb.persisted_seqno;
        let fresh: Vec<Arc<Item>> = vb
            .log
            .iter()
            .filter(|item| item.by_seqno > from)
            .cloned()
            .collect();
        for item in fresh {
            vb.disk.retain(|_, old| old.key != item.key);
            vb.disk.insert(item.by_seqno, item);
        }
        vb.persisted_seqno = vb.high_seqno;
        Ok(vb.persisted_seqno)
    }

    pub fn create_new_checkpoint(&self, vbid: Vbid) -> Result<u64, StoreError> {
        self.create_checkpoint(vbid)
    }

    /// Evict persisted items of closed checkpoints that no cursor still needs.
    pub fn remove_closed_checkpoints(&self, vbid: Vbid) -> Result<usize, StoreError> {
        let mut guard = self.write();
        let min_cursor = guard
            .cursors
            .values()
            .filter(|c| c.vbid == vbid)
            .map(|c| c.position)
            .min();
        let vb = guard
            .vbuckets
            .get_mut(&vbid)
            .ok_or(StoreError::NoSuchVbucket { vbid })?;
        let open_start = vb.open_checkpoint().start_seqno;
        let limit = min_cursor.unwrap_or(u64::MAX);
        let persisted = vb.persisted_seqno;
        let before = vb.log.len();
        let mut released = 0;
        vb.log.retain(|item| {
            let evict =
                item.by_seqno < open_start && item.by_seqno <= persisted && item.by_seqno <= limit;
            if evict {
                released += item.size();
            }
            !evict
        });
        let open = vb.open_checkpoint();
        vb.checkpoints.retain(|c| c.id == open.id);
        self.memory.release(released);
        Ok(before - vb.log.len())
    }

    pub fn get(&self, vbid: Vbid, key: &[u8]) -> Option<Arc<Item>> {
        let guard = self.read();
        guard.vbuckets.get(&vbid)?.docs.get(key).cloned()
    }

    /// Seqnos applied through [`VBucketStore::apply`], in apply order.
    pub fn applied_seqnos(&self, vbid: Vbid) -> Vec<u64> {
        let guard = self.read();
        guard
            .vbuckets
            .get(&vbid)
            .map(|vb| vb.applied.clone())
            .unwrap_or_default()
    }

    /// Make the next `count` applies fail with `TempFail`.
    pub fn fail_next_applies(&self, count: usize) {
        self.write().fail_applies = count;
    }

    /// Make the apply of `seqno` fail once with a hard store error.
    pub fn reject_apply_of(&self, seqno: u64) {
        self.write().reject_seqno = Some(seqno);
    }

    pub fn set_purge_seqno(&self, vbid: Vbid, seqno: u64) {
        if let Some(vb) = self.write().vbuckets.get_mut(&vbid) {
            vb.purge_seqno = seqno;
        }
    }
}

fn vbucket_mut(state: &mut BucketState, vbid: Vbid) -> Result<&mut VBucketData, StoreError> {
    state
        .vbuckets
        .get_mut(&vbid)
        .ok_or(StoreError::NoSuchVbucket { vbid })
}

impl VBucketStore for MemoryBucket {
    fn info(&self, vbid: Vbid) -> Option<VBucketInfo> {
        self.read().vbuckets.get(&vbid).map(VBucketData::info)
    }

    fn set_state(&self, vbid: Vbid, state: VBucketState) -> Result<(), StoreError> {
        let mut guard = self.write();
        let vb = vbucket_mut(&mut guard, vbid)?;
        let previous = vb.state;
        vb.state = state;
        if state == VBucketState::Replica {
            vb.create_checkpoint();
        }
        if state == VBucketState::Active && previous != VBucketState::Active {
            let high = vb.high_seqno;
            vb.failover.create_entry(high);
        }
        tracing::debug!(vb = %vbid, from = %previous, to = %state, "vbucket state changed");
        Ok(())
    }

    fn apply(&self, item: &Item) -> Result<(), StoreError> {
        let mut guard = self.write();
        if guard.fail_applies > 0 {
            guard.fail_applies -= 1;
            return Err(StoreError::TempFail { vbid: item.vbid });
        }
        if guard.reject_seqno == Some(item.by_seqno) {
            guard.reject_seqno = None;
            return Err(StoreError::Failed {
                reason: format!("rejected seqno {}", item.by_seqno),
            });
        }
        let vb = vbucket_mut(&mut guard, item.vbid)?;
        vb.applied.push(item.by_seqno);
        vb.push(Arc::new(item.clone()));
        self.memory.charge(item.size());
        Ok(())
    }

    fn rollback(&self, vbid: Vbid, seqno: u64) -> Result<u64, StoreError> {
        let mut guard = self.write();
        let vb = vbucket_mut(&mut guard, vbid)?;
        let mut released = 0;
        vb.log.retain(|item| {
            let keep = item.by_seqno <= seqno;
            if !keep {
                released += item.size();
            }
            keep
        });
        vb.disk.retain(|&s, _| s <= seqno);
        vb.docs.retain(|_, item| item.by_seqno <= seqno);
        let high = vb
            .log
            .last()
            .map(|item| item.by_seqno)
            .max(vb.disk.keys().next_back().copied())
            .unwrap_or(0)
            .min(seqno);
        vb.high_seqno = high;
        vb.persisted_seqno = vb.persisted_seqno.min(high);
        vb.snap_start = high;
        vb.snap_end = high;
        self.memory.release(released);
        Ok(high)
    }

    fn set_snapshot(&self, vbid: Vbid, start: u64, end: u64) -> Result<(), StoreError> {
        let mut guard = self.write();
        let vb = vbucket_mut(&mut guard, vbid)?;
        vb.snap_start = start;
        vb.snap_end = end;
        Ok(())
    }

    fn set_open_checkpoint_id(&self, vbid: Vbid, id: u64) -> Result<(), StoreError> {
        let mut guard = self.write();
        let vb = vbucket_mut(&mut guard, vbid)?;
        match vb.checkpoints.last_mut() {
            Some(open) => open.id = id,
            None => vb.checkpoints.push(Checkpoint {
                id,
                start_seqno: vb.high_seqno + 1,
            }),
        }
        Ok(())
    }

    fn create_checkpoint(&self, vbid: Vbid) -> Result<u64, StoreError> {
        let mut guard = self.write();
        Ok(vbucket_mut(&mut guard, vbid)?.create_checkpoint())
    }

    fn set_backfill_phase(&self, vbid: Vbid, on: bool) -> Result<(), StoreError> {
        let mut guard = self.write();
        vbucket_mut(&mut guard, vbid)?.backfill_phase = on;
        Ok(())
    }

    fn set_receiving_initial_disk_snapshot(
        &self,
        vbid: Vbid,
        on: bool,
    ) -> Result<(), StoreError> {
        let mut guard = self.write();
        vbucket_mut(&mut guard, vbid)?.receiving_initial_disk_snapshot = on;
        Ok(())
    }
}

impl CheckpointLog for MemoryBucket {
    fn register_cursor(
        &self,
        name: &str,
        vbid: Vbid,
        start_seqno: u64,
    ) -> Result<CursorRegistration, StoreError> {
        let mut guard = self.write();
        let vb = guard
            .vbuckets
            .get(&vbid)
            .ok_or(StoreError::NoSuchVbucket { vbid })?;
        let mem_low = vb.mem_low_seqno();
        let (position, backfill) = if start_seqno + 1 < mem_low {
            if vb.persisted_seqno + 1 < mem_low {
                return Err(StoreError::RollbackRequired {
                    seqno: vb.persisted_seqno,
                });
            }
            (mem_low - 1, Some((start_seqno + 1, mem_low - 1)))
        } else {
            (start_seqno, None)
        };
        guard.next_cursor += 1;
        let cursor = CursorId(guard.next_cursor);
        guard.cursors.insert(cursor, CursorState { vbid, position });
        tracing::trace!(cursor = cursor.0, name, vb = %vbid, position, "cursor placed");
        Ok(CursorRegistration { cursor, backfill })
    }

    fn pull_next_batch(&self, cursor: CursorId, max_items: usize) -> Result<Batch, StoreError> {
        let guard = self.read();
        let state = guard
            .cursors
            .get(&cursor)
            .ok_or(StoreError::UnknownCursor { cursor })?;
        let vb = guard
            .vbuckets
            .get(&state.vbid)
            .ok_or(StoreError::NoSuchVbucket { vbid: state.vbid })?;
        let mut pending = vb
            .log
            .iter()
            .filter(|item| item.by_seqno > state.position)
            .peekable();
        let Some(first) = pending.peek().map(|item| item.by_seqno) else {
            return Ok(Batch::default());
        };
        let checkpoint_end = vb
            .checkpoints
            .iter()
            .map(|c| c.start_seqno)
            .find(|&start| start > first)
            .unwrap_or(u64::MAX);
        let checkpoint_start = vb
            .checkpoints
            .iter()
            .any(|c| c.start_seqno == first && c.start_seqno > 1);
        let items: Vec<Arc<Item>> = pending
            .take_while(|item| item.by_seqno < checkpoint_end)
            .take(max_items.max(1))
            .cloned()
            .collect();
        let snap_end = items.last().map(|item| item.by_seqno).unwrap_or(first);
        Ok(Batch {
            items,
            snap_start: first,
            snap_end,
            checkpoint_start,
        })
    }

    fn advance(&self, cursor: CursorId, up_to: u64) -> Result<(), StoreError> {
        let mut guard = self.write();
        let state = guard
            .cursors
            .get_mut(&cursor)
            .ok_or(StoreError::UnknownCursor { cursor })?;
        state.position = state.position.max(up_to);
        Ok(())
    }

    fn remove_cursor(&self, cursor: CursorId) {
        self.write().cursors.remove(&cursor);
    }

    fn read_persisted(
        &self,
        vbid: Vbid,
        start: u64,
        end: u64,
        max_items: usize,
    ) -> Result<Vec<Arc<Item>>, StoreError> {
        let guard = self.read();
        let vb = guard
            .vbuckets
            .get(&vbid)
            .ok_or(StoreError::NoSuchVbucket { vbid })?;
        if start > end {
            return Ok(Vec::new());
        }
        Ok(vb
            .disk
            .range(start..=end)
            .take(max_items.max(1))
            .map(|(_, item)| Arc::clone(item))
            .collect())
    }
}

impl FailoverLog for MemoryBucket {
    fn table(&self, vbid: Vbid) -> Option<FailoverTable> {
        self.read().vbuckets.get(&vbid).map(|vb| vb.failover.clone())
    }

    fn append_entry(&self, vbid: Vbid, entry: FailoverEntry) -> Result<(), StoreError> {
        let mut guard = self.write();
        vbucket_mut(&mut guard, vbid)?.failover.add_entry(entry);
        Ok(())
    }

    fn entries_since(&self, vbid: Vbid, seqno: u64) -> Result<Vec<FailoverEntry>, StoreError> {
        let guard = self.read();
        let vb = guard
            .vbuckets
            .get(&vbid)
            .ok_or(StoreError::NoSuchVbucket { vbid })?;
        Ok(vb.failover.entries_since(seqno))
    }

    fn replace(&self, vbid: Vbid, entries: Vec<FailoverEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut guard = self.write();
        vbucket_mut(&mut guard, vbid)?.failover =
            FailoverTable::from_entries(entries, self.failover_max);
        Ok(())
    }

    fn prune_after(&self, vbid: Vbid, seqno: u64) -> Result<(), StoreError> {
        let mut guard = self.write();
        vbucket_mut(&mut guard, vbid)?.failover.prune_after(seqno);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VB: Vbid = Vbid::new(0);

    fn bucket() -> MemoryBucket {
        let bucket = MemoryBucket::default();
        bucket.create_vbucket(VB, VBucketState::Active);
        bucket
    }

    #[test]
    fn queued_items_get_ascending_seqnos() {
        let bucket = bucket();
        assert_eq!(bucket.queue_mutation(VB, "a", "1").expect("queue"), 1);
        assert_eq!(bucket.queue_mutation(VB, "b", "2").expect("queue"), 2);
        assert_eq!(bucket.info(VB).map(|i| i.high_seqno), Some(2));
        assert_eq!(bucket.get(VB, b"b").map(|i| i.by_seqno), Some(2));
        assert!(bucket.memory().mem_used() > 0);
    }

    #[test]
    fn cursor_pulls_within_checkpoint_then_advances() {
        let bucket = bucket();
        bucket.queue_mutation(VB, "a", "1").expect("queue");
        bucket.queue_mutation(VB, "b", "2").expect("queue");
        bucket.create_new_checkpoint(VB).expect("checkpoint");
        bucket.queue_mutation(VB, "c", "3").expect("queue");

        let reg = bucket.register_cursor("c1", VB, 0).expect("register");
        assert_eq!(reg.backfill, None);
        let batch = bucket.pull_next_batch(reg.cursor, 10).expect("pull");
        assert_eq!(batch.items.len(), 2);
        assert!(!batch.checkpoint_start);
        bucket.advance(reg.cursor, batch.snap_end).expect("advance");

        let batch = bucket.pull_next_batch(reg.cursor, 10).expect("pull");
        assert_eq!(batch.items.len(), 1);
        assert!(batch.checkpoint_start);
        assert_eq!((batch.snap_start, batch.snap_end), (3, 3));
    }

    #[test]
    fn evicted_history_requires_backfill() {
        let bucket = bucket();
        for key in ["a", "b", "c"] {
            bucket.queue_mutation(VB, key, "v").expect("queue");
        }
        bucket.persist(VB).expect("persist");
        bucket.create_new_checkpoint(VB).expect("checkpoint");
        assert_eq!(bucket.remove_closed_checkpoints(VB).expect("remove"), 3);

        let reg = bucket.register_cursor("c1", VB, 0).expect("register");
        assert_eq!(reg.backfill, Some((1, 3)));
        let disk = bucket.read_persisted(VB, 1, 3, 10).expect("read");
        assert_eq!(disk.iter().map(|i| i.by_seqno).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn replica_state_opens_new_checkpoint() {
        let bucket = MemoryBucket::default();
        bucket.create_vbucket(VB, VBucketState::Replica);
        assert_eq!(bucket.info(VB).map(|i| i.open_checkpoint_id), Some(1));
        bucket.set_state(VB, VBucketState::Replica).expect("set");
        assert_eq!(bucket.info(VB).map(|i| i.open_checkpoint_id), Some(2));
    }

    #[test]
    fn rollback_discards_newer_history() {
        let bucket = bucket();
        for key in ["a", "b", "c", "d"] {
            bucket.queue_mutation(VB, key, "v").expect("queue");
        }
        assert_eq!(bucket.rollback(VB, 2).expect("rollback"), 2);
        assert!(bucket.get(VB, b"d").is_none());
        assert!(bucket.get(VB, b"b").is_some());
    }

    #[test]
    fn injected_failures_are_temporary() {
        let bucket = bucket();
        bucket.fail_next_applies(1);
        let item = Item::mutation(VB, "k", "v", 1);
        assert_eq!(
            bucket.apply(&item),
            Err(StoreError::TempFail { vbid: VB })
        );
        bucket.apply(&item).expect("second apply");
        assert_eq!(bucket.applied_seqnos(VB), vec![1]);
    }
}
