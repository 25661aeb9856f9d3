//! Protocol messages exchanged by producers and consumers.
//!
//! Messages are the engine's view of a packet; encoding them is the
//! transport's job. Sizes follow the binary header accounting so flow
//! control charges the same bytes the wire would carry.

use std::sync::Arc;

use crate::core::{FailoverEntry, Item, Operation, Status, VBucketState, Vbid};

/// Flags passed to `open`.
pub mod open_flags {
    pub const PRODUCER: u32 = 0x01;
    pub const NOTIFIER: u32 = 0x02;
    pub const INCLUDE_XATTRS: u32 = 0x04;
    pub const NO_VALUE: u32 = 0x08;
    pub const INCLUDE_DELETE_TIMES: u32 = 0x20;
    pub const NO_VALUE_WITH_UNDERLYING_DATATYPE: u32 = 0x40;
}

/// Flags passed to `stream_req` / `add_stream`.
pub mod stream_flags {
    pub const TAKEOVER: u32 = 0x01;
    pub const DISK_ONLY: u32 = 0x02;
    pub const TO_LATEST: u32 = 0x04;
    pub const ACTIVE_VB_ONLY: u32 = 0x10;
}

/// Snapshot marker flags.
pub mod marker_flags {
    pub const MEMORY: u32 = 0x01;
    pub const DISK: u32 = 0x02;
    pub const CHECKPOINT: u32 = 0x04;
    pub const ACK: u32 = 0x08;
}

const MUTATION_BASE: usize = 55;
const PREPARE_BASE: usize = 57;
const DELETION_BASE: usize = 42;
const DELETION_V2_BASE: usize = 45;
const EXPIRATION_BASE: usize = 45;
const COMMIT_BASE: usize = 48;
const ABORT_BASE: usize = 40;
const SYSTEM_EVENT_BASE: usize = 42;
const SNAPSHOT_MARKER_SIZE: usize = 44;
const STREAM_END_SIZE: usize = 28;
const SET_VBUCKET_STATE_SIZE: usize = 25;
const SEQNO_ACK_SIZE: usize = 40;
const STREAM_REQUEST_SIZE: usize = 72;
const ADD_STREAM_RESPONSE_SIZE: usize = 28;
const NOOP_SIZE: usize = 24;
const BUFFER_ACK_SIZE: usize = 28;
const CONTROL_BASE: usize = 24;
const GET_ERROR_MAP_SIZE: usize = 26;
const RESPONSE_SIZE: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndStreamReason {
    Ok,
    Closed,
    State,
    Disconnected,
    TooSlow,
    BackfillFail,
    Rollback,
}

impl EndStreamReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndStreamReason::Ok => "ok",
            EndStreamReason::Closed => "closed",
            EndStreamReason::State => "state",
            EndStreamReason::Disconnected => "disconnected",
            EndStreamReason::TooSlow => "too_slow",
            EndStreamReason::BackfillFail => "backfill_fail",
            EndStreamReason::Rollback => "rollback",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotMarker {
    pub opaque: u32,
    pub vbid: Vbid,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

impl SnapshotMarker {
    pub fn is_disk(&self) -> bool {
        self.flags & marker_flags::DISK != 0
    }

    pub fn is_memory(&self) -> bool {
        self.flags & marker_flags::MEMORY != 0
    }

    pub fn wants_checkpoint(&self) -> bool {
        self.flags & marker_flags::CHECKPOINT != 0
    }

    pub fn wants_ack(&self) -> bool {
        self.flags & marker_flags::ACK != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DcpResponse {
    StreamRequest {
        opaque: u32,
        vbid: Vbid,
        flags: u32,
        start_seqno: u64,
        end_seqno: u64,
        vb_uuid: u64,
        snap_start: u64,
        snap_end: u64,
    },
    AddStreamResponse {
        opaque: u32,
        stream_opaque: u32,
        status: Status,
    },
    SnapshotMarker(SnapshotMarker),
    SnapshotMarkerResponse {
        opaque: u32,
        status: Status,
    },
    Mutation {
        opaque: u32,
        item: Arc<Item>,
    },
    Deletion {
        opaque: u32,
        item: Arc<Item>,
        include_delete_time: bool,
    },
    Expiration {
        opaque: u32,
        item: Arc<Item>,
    },
    Prepare {
        opaque: u32,
        item: Arc<Item>,
    },
    Commit {
        opaque: u32,
        item: Arc<Item>,
    },
    Abort {
        opaque: u32,
        item: Arc<Item>,
    },
    SystemEvent {
        opaque: u32,
        item: Arc<Item>,
    },
    StreamEnd {
        opaque: u32,
        vbid: Vbid,
        reason: EndStreamReason,
    },
    SetVBucketState {
        opaque: u32,
        vbid: Vbid,
        state: VBucketState,
    },
    Noop {
        opaque: u32,
    },
    BufferAck {
        opaque: u32,
        bytes: u32,
    },
    Control {
        opaque: u32,
        key: String,
        value: String,
    },
    GetErrorMap {
        opaque: u32,
        version: u16,
    },
    SeqnoAck {
        opaque: u32,
        vbid: Vbid,
        in_memory_seqno: u64,
        on_disk_seqno: u64,
    },
}

impl DcpResponse {
    /// Wrap a change record in the message matching its operation.
    pub fn from_item(opaque: u32, item: Arc<Item>, include_delete_time: bool) -> Self {
        match item.operation {
            Operation::Mutation => DcpResponse::Mutation { opaque, item },
            Operation::Deletion => DcpResponse::Deletion {
                opaque,
                item,
                include_delete_time,
            },
            Operation::Expiration => DcpResponse::Expiration { opaque, item },
            Operation::Prepare => DcpResponse::Prepare { opaque, item },
            Operation::Commit => DcpResponse::Commit { opaque, item },
            Operation::Abort => DcpResponse::Abort { opaque, item },
            Operation::SystemEvent => DcpResponse::SystemEvent { opaque, item },
        }
    }

    pub fn opaque(&self) -> u32 {
        match self {
            DcpResponse::StreamRequest { opaque, .. }
            | DcpResponse::AddStreamResponse { opaque, .. }
            | DcpResponse::SnapshotMarkerResponse { opaque, .. }
            | DcpResponse::Mutation { opaque, .. }
            | DcpResponse::Deletion { opaque, .. }
            | DcpResponse::Expiration { opaque, .. }
            | DcpResponse::Prepare { opaque, .. }
            | DcpResponse::Commit { opaque, .. }
            | DcpResponse::Abort { opaque, .. }
            | DcpResponse::SystemEvent { opaque, .. }
            | DcpResponse::StreamEnd { opaque, .. }
            | DcpResponse::SetVBucketState { opaque, .. }
            | DcpResponse::Noop { opaque }
            | DcpResponse::BufferAck { opaque, .. }
            | DcpResponse::Control { opaque, .. }
            | DcpResponse::GetErrorMap { opaque, .. }
            | DcpResponse::SeqnoAck { opaque, .. } => *opaque,
            DcpResponse::SnapshotMarker(marker) => marker.opaque,
        }
    }

    /// The change record carried by item-bearing messages.
    pub fn item(&self) -> Option<&Arc<Item>> {
        match self {
            DcpResponse::Mutation { item, .. }
            | DcpResponse::Deletion { item, .. }
            | DcpResponse::Expiration { item, .. }
            | DcpResponse::Prepare { item, .. }
            | DcpResponse::Commit { item, .. }
            | DcpResponse::Abort { item, .. }
            | DcpResponse::SystemEvent { item, .. } => Some(item),
            _ => None,
        }
    }

    pub fn by_seqno(&self) -> Option<u64> {
        self.item().map(|item| item.by_seqno)
    }

    pub fn vbid(&self) -> Option<Vbid> {
        match self {
            DcpResponse::StreamRequest { vbid, .. }
            | DcpResponse::StreamEnd { vbid, .. }
            | DcpResponse::SetVBucketState { vbid, .. }
            | DcpResponse::SeqnoAck { vbid, .. } => Some(*vbid),
            DcpResponse::SnapshotMarker(marker) => Some(marker.vbid),
            other => other.item().map(|item| item.vbid),
        }
    }

    /// Bytes this message occupies on the wire.
    pub fn message_size(&self) -> usize {
        fn payload(item: &Item) -> usize {
            item.key.len() + item.value.len()
        }
        match self {
            DcpResponse::StreamRequest { .. } => STREAM_REQUEST_SIZE,
            DcpResponse::AddStreamResponse { .. } => ADD_STREAM_RESPONSE_SIZE,
            DcpResponse::SnapshotMarker(_) => SNAPSHOT_MARKER_SIZE,
            DcpResponse::SnapshotMarkerResponse { .. } => RESPONSE_SIZE,
            DcpResponse::Mutation { item, .. } => MUTATION_BASE + payload(item),
            DcpResponse::Deletion {
                item,
                include_delete_time,
                ..
            } => {
                let base = if *include_delete_time {
                    DELETION_V2_BASE
                } else {
                    DELETION_BASE
                };
                base + payload(item)
            }
            DcpResponse::Expiration { item, .. } => EXPIRATION_BASE + payload(item),
            DcpResponse::Prepare { item, .. } => PREPARE_BASE + payload(item),
            DcpResponse::Commit { item, .. } => COMMIT_BASE + item.key.len(),
            DcpResponse::Abort { item, .. } => ABORT_BASE + item.key.len(),
            DcpResponse::SystemEvent { item, .. } => SYSTEM_EVENT_BASE + payload(item),
            DcpResponse::StreamEnd { .. } => STREAM_END_SIZE,
            DcpResponse::SetVBucketState { .. } => SET_VBUCKET_STATE_SIZE,
            DcpResponse::Noop { .. } => NOOP_SIZE,
            DcpResponse::BufferAck { .. } => BUFFER_ACK_SIZE,
            DcpResponse::Control { key, value, .. } => CONTROL_BASE + key.len() + value.len(),
            DcpResponse::GetErrorMap { .. } => GET_ERROR_MAP_SIZE,
            DcpResponse::SeqnoAck { .. } => SEQNO_ACK_SIZE,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DcpResponse::StreamRequest { .. } => "stream_request",
            DcpResponse::AddStreamResponse { .. } => "add_stream_response",
            DcpResponse::SnapshotMarker(_) => "snapshot_marker",
            DcpResponse::SnapshotMarkerResponse { .. } => "snapshot_marker_response",
            DcpResponse::Mutation { .. } => "mutation",
            DcpResponse::Deletion { .. } => "deletion",
            DcpResponse::Expiration { .. } => "expiration",
            DcpResponse::Prepare { .. } => "prepare",
            DcpResponse::Commit { .. } => "commit",
            DcpResponse::Abort { .. } => "abort",
            DcpResponse::SystemEvent { .. } => "system_event",
            DcpResponse::StreamEnd { .. } => "stream_end",
            DcpResponse::SetVBucketState { .. } => "set_vbucket_state",
            DcpResponse::Noop { .. } => "noop",
            DcpResponse::BufferAck { .. } => "buffer_ack",
            DcpResponse::Control { .. } => "control",
            DcpResponse::GetErrorMap { .. } => "get_error_map",
            DcpResponse::SeqnoAck { .. } => "seqno_ack",
        }
    }
}

/// A peer's reply to a request this side sent earlier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerResponse {
    StreamRequest {
        opaque: u32,
        status: Status,
        failover_log: Vec<FailoverEntry>,
        rollback_seqno: u64,
    },
    GetErrorMap {
        opaque: u32,
        status: Status,
    },
    Control {
        opaque: u32,
        status: Status,
    },
    Noop {
        opaque: u32,
        status: Status,
    },
    SetVBucketState {
        opaque: u32,
        status: Status,
    },
    SnapshotMarker {
        opaque: u32,
        status: Status,
    },
}

impl PeerResponse {
    pub fn opaque(&self) -> u32 {
        match self {
            PeerResponse::StreamRequest { opaque, .. }
            | PeerResponse::GetErrorMap { opaque, .. }
            | PeerResponse::Control { opaque, .. }
            | PeerResponse::Noop { opaque, .. }
            | PeerResponse::SetVBucketState { opaque, .. }
            | PeerResponse::SnapshotMarker { opaque, .. } => *opaque,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            PeerResponse::StreamRequest { status, .. }
            | PeerResponse::GetErrorMap { status, .. }
            | PeerResponse::Control { status, .. }
            | PeerResponse::Noop { status, .. }
            | PeerResponse::SetVBucketState { status, .. }
            | PeerResponse::SnapshotMarker { status, .. } => *status,
        }
    }
}
