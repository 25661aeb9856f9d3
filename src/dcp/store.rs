//! External collaborators: the vbucket store, the checkpoint log and the
//! failover log provider.
//!
//! The replication engine only ever talks to these through the traits here;
//! [`super::MemoryBucket`] implements all three in memory.

use std::sync::Arc;

use thiserror::Error;

use crate::core::{FailoverEntry, FailoverTable, Item, Status, VBucketState, Vbid};
use crate::error::Transience;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{vbid} does not exist")]
    NoSuchVbucket { vbid: Vbid },
    #[error("cursor must roll back to seqno {seqno}")]
    RollbackRequired { seqno: u64 },
    #[error("unknown cursor {cursor:?}")]
    UnknownCursor { cursor: CursorId },
    /// Out of memory or a transient storage condition; retry later.
    #[error("storage temporarily unavailable on {vbid}")]
    TempFail { vbid: Vbid },
    #[error("store failure: {reason}")]
    Failed { reason: String },
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::TempFail { .. } => Transience::Retryable,
            StoreError::Failed { .. } => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            StoreError::NoSuchVbucket { .. } => Status::NotMyVbucket,
            StoreError::RollbackRequired { .. } => Status::Rollback,
            StoreError::UnknownCursor { .. } => Status::KeyNotFound,
            StoreError::TempFail { .. } => Status::TempFail,
            StoreError::Failed { .. } => Status::Failed,
        }
    }
}

/// Point-in-time view of one vbucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VBucketInfo {
    pub state: VBucketState,
    pub high_seqno: u64,
    pub purge_seqno: u64,
    pub persisted_seqno: u64,
    pub snap_start: u64,
    pub snap_end: u64,
    pub open_checkpoint_id: u64,
    pub backfill_phase: bool,
    pub receiving_initial_disk_snapshot: bool,
}

/// The partition store a consumer applies into and a producer reads state from.
pub trait VBucketStore: Send + Sync {
    fn info(&self, vbid: Vbid) -> Option<VBucketInfo>;

    fn set_state(&self, vbid: Vbid, state: VBucketState) -> Result<(), StoreError>;

    /// Apply a replicated change record.
    fn apply(&self, item: &Item) -> Result<(), StoreError>;

    /// Discard everything after `seqno`; returns the new high seqno.
    fn rollback(&self, vbid: Vbid, seqno: u64) -> Result<u64, StoreError>;

    fn set_snapshot(&self, vbid: Vbid, start: u64, end: u64) -> Result<(), StoreError>;

    fn set_open_checkpoint_id(&self, vbid: Vbid, id: u64) -> Result<(), StoreError>;

    /// Close the open checkpoint and open a new one; returns its id.
    fn create_checkpoint(&self, vbid: Vbid) -> Result<u64, StoreError>;

    fn set_backfill_phase(&self, vbid: Vbid, on: bool) -> Result<(), StoreError>;

    fn set_receiving_initial_disk_snapshot(&self, vbid: Vbid, on: bool)
    -> Result<(), StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorId(pub u64);

/// Result of placing a cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorRegistration {
    pub cursor: CursorId,
    /// Seqnos that are no longer in memory and must be read from disk first.
    pub backfill: Option<(u64, u64)>,
}

/// One pull from a cursor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    pub items: Vec<Arc<Item>>,
    pub snap_start: u64,
    pub snap_end: u64,
    /// The batch starts a new checkpoint.
    pub checkpoint_start: bool,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// The ordered in-memory mutation log with replayable cursors.
pub trait CheckpointLog: Send + Sync {
    /// Place a cursor just after `start_seqno`.
    fn register_cursor(
        &self,
        name: &str,
        vbid: Vbid,
        start_seqno: u64,
    ) -> Result<CursorRegistration, StoreError>;

    /// Items after the cursor, within one checkpoint, without moving it.
    fn pull_next_batch(&self, cursor: CursorId, max_items: usize) -> Result<Batch, StoreError>;

    /// Move the cursor past `up_to`.
    fn advance(&self, cursor: CursorId, up_to: u64) -> Result<(), StoreError>;

    fn remove_cursor(&self, cursor: CursorId);

    /// Persisted items in `start..=end`, at most `max_items`.
    fn read_persisted(
        &self,
        vbid: Vbid,
        start: u64,
        end: u64,
        max_items: usize,
    ) -> Result<Vec<Arc<Item>>, StoreError>;
}

pub trait FailoverLog: Send + Sync {
    fn table(&self, vbid: Vbid) -> Option<FailoverTable>;

    fn append_entry(&self, vbid: Vbid, entry: FailoverEntry) -> Result<(), StoreError>;

    /// Entries newest first, ending with the branch that covers `seqno`.
    fn entries_since(&self, vbid: Vbid, seqno: u64) -> Result<Vec<FailoverEntry>, StoreError>;

    /// Adopt the peer's log wholesale (replica accepting a stream).
    fn replace(&self, vbid: Vbid, entries: Vec<FailoverEntry>) -> Result<(), StoreError>;

    fn prune_after(&self, vbid: Vbid, seqno: u64) -> Result<(), StoreError>;
}
