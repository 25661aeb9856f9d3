use std::sync::Arc;

use crate::core::{Item, Vbid};

use super::store::{Batch, CheckpointLog, CursorId, StoreError};

/// An active stream's cursor on the checkpoint log.
///
/// Owning the bridge owns the cursor: dropping it releases the cursor so the
/// log can free checkpoints the stream no longer needs.
pub struct CursorBridge {
    log: Arc<dyn CheckpointLog>,
    cursor: CursorId,
    vbid: Vbid,
}

impl CursorBridge {
    /// Register a cursor after `start_seqno`; also returns the on-disk range
    /// to replay first when the log no longer holds it.
    pub fn register(
        log: Arc<dyn CheckpointLog>,
        name: &str,
        vbid: Vbid,
        start_seqno: u64,
    ) -> Result<(Self, Option<(u64, u64)>), StoreError> {
        let registration = log.register_cursor(name, vbid, start_seqno)?;
        tracing::debug!(
            vb = %vbid,
            cursor = registration.cursor.0,
            backfill = ?registration.backfill,
            "cursor registered"
        );
        Ok((
            Self {
                log,
                cursor: registration.cursor,
                vbid,
            },
            registration.backfill,
        ))
    }

    pub fn id(&self) -> CursorId {
        self.cursor
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub fn pull(&self, max_items: usize) -> Result<Batch, StoreError> {
        self.log.pull_next_batch(self.cursor, max_items)
    }

    pub fn advance(&self, up_to: u64) -> Result<(), StoreError> {
        self.log.advance(self.cursor, up_to)
    }

    pub fn read_persisted(
        &self,
        start: u64,
        end: u64,
        max_items: usize,
    ) -> Result<Vec<Arc<Item>>, StoreError> {
        self.log.read_persisted(self.vbid, start, end, max_items)
    }
}

impl Drop for CursorBridge {
    fn drop(&mut self) {
        self.log.remove_cursor(self.cursor);
    }
}

impl std::fmt::Debug for CursorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorBridge")
            .field("cursor", &self.cursor)
            .field("vbid", &self.vbid)
            .finish()
    }
}
