//! The sequenced change record streamed between peers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::ids::Vbid;
use super::value::Datatype;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Mutation,
    Deletion,
    Expiration,
    /// Durable write awaiting commit.
    Prepare,
    Commit,
    Abort,
    SystemEvent,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Mutation => "mutation",
            Operation::Deletion => "deletion",
            Operation::Expiration => "expiration",
            Operation::Prepare => "prepare",
            Operation::Commit => "commit",
            Operation::Abort => "abort",
            Operation::SystemEvent => "system_event",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    Majority,
    MajorityAndPersistOnMaster,
    PersistToMajority,
}

/// A change record as held by the checkpoint log.
///
/// Items are shared as `Arc<Item>` between the log, ready queues and the
/// transport; a response that needs a different value is built from a fresh
/// copy so the cached record is never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub vbid: Vbid,
    pub key: Bytes,
    pub value: Bytes,
    pub datatype: Datatype,
    pub operation: Operation,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub lock_time: u32,
    pub delete_time: u32,
    pub durability: Option<DurabilityLevel>,
}

impl Item {
    pub fn new(
        operation: Operation,
        vbid: Vbid,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        by_seqno: u64,
    ) -> Self {
        Self {
            vbid,
            key: key.into(),
            value: value.into(),
            datatype: Datatype::RAW,
            operation,
            by_seqno,
            rev_seqno: 1,
            cas: 0,
            flags: 0,
            expiry: 0,
            lock_time: 0,
            delete_time: 0,
            durability: None,
        }
    }

    pub fn mutation(
        vbid: Vbid,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        by_seqno: u64,
    ) -> Self {
        Self::new(Operation::Mutation, vbid, key, value, by_seqno)
    }

    pub fn deletion(vbid: Vbid, key: impl Into<Bytes>, by_seqno: u64) -> Self {
        Self::new(Operation::Deletion, vbid, key, Bytes::new(), by_seqno)
    }

    pub fn prepare(
        vbid: Vbid,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        by_seqno: u64,
        level: DurabilityLevel,
    ) -> Self {
        let mut item = Self::new(Operation::Prepare, vbid, key, value, by_seqno);
        item.durability = Some(level);
        item
    }

    pub fn with_datatype(mut self, datatype: Datatype) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_rev_seqno(mut self, rev_seqno: u64) -> Self {
        self.rev_seqno = rev_seqno;
        self
    }

    pub fn with_durability(mut self, level: DurabilityLevel) -> Self {
        self.durability = Some(level);
        self
    }

    /// Copy of this record carrying a different value.
    pub fn with_value(&self, value: Bytes, datatype: Datatype) -> Self {
        let mut copy = self.clone();
        copy.value = value;
        copy.datatype = datatype;
        copy
    }

    pub fn is_durable(&self) -> bool {
        self.durability.is_some() || self.operation == Operation::Prepare
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.operation, Operation::Deletion | Operation::Expiration)
    }

    /// Bytes charged against bucket memory for this record.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}
