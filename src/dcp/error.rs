use thiserror::Error;

use crate::core::{Status, ValueError, Vbid};
use crate::error::{Effect, Transience};

use super::store::StoreError;

/// Errors surfaced by streams, connections and the directory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DcpError {
    #[error("no stream for {vbid}")]
    StreamNotFound { vbid: Vbid },

    #[error("opaque {got} does not match stream opaque {expected} on {vbid}")]
    OpaqueMismatch {
        vbid: Vbid,
        expected: u32,
        got: u32,
    },

    #[error("stream already exists for {vbid}")]
    StreamExists { vbid: Vbid },

    #[error("{vbid} is not in a state that serves this request")]
    NotMyVbucket { vbid: Vbid },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("unknown control key `{key}`")]
    UnknownControl { key: String },

    #[error("peer must roll back to seqno {seqno}")]
    Rollback { seqno: u64 },

    /// The message was retained in the stream buffer; the caller must stop
    /// reading until the connection is notified.
    #[error("{vbid} is buffering incoming messages")]
    Backpressure { vbid: Vbid },

    #[error("temporary failure, retry later")]
    TempFail,

    #[error("message too large for the transport")]
    TooBig,

    #[error("seqno {seqno} on {vbid} went backwards from {last}")]
    SequenceInvariant { vbid: Vbid, last: u64, seqno: u64 },

    #[error("seqno {seqno} on {vbid} is outside snapshot {start}..={end}")]
    OutOfRange {
        vbid: Vbid,
        seqno: u64,
        start: u64,
        end: u64,
    },

    #[error("connection must disconnect")]
    Disconnect,

    #[error("operation not supported: {what}")]
    NotSupported { what: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Value(#[from] ValueError),
}

impl DcpError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        DcpError::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            DcpError::Backpressure { .. } | DcpError::TempFail => Transience::Retryable,
            DcpError::Store(e) => e.transience(),
            DcpError::Disconnect => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            DcpError::Backpressure { .. } | DcpError::SequenceInvariant { .. } => Effect::Some,
            DcpError::Store(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }

    /// Result code handed back across the engine callback interface.
    pub fn status(&self) -> Status {
        match self {
            DcpError::StreamNotFound { .. } | DcpError::OpaqueMismatch { .. } => {
                Status::KeyNotFound
            }
            DcpError::StreamExists { .. } => Status::KeyExists,
            DcpError::NotMyVbucket { .. } => Status::NotMyVbucket,
            DcpError::InvalidArgument { .. } | DcpError::UnknownControl { .. } => {
                Status::InvalidArgument
            }
            DcpError::Rollback { .. } => Status::Rollback,
            DcpError::Backpressure { .. } | DcpError::TempFail => Status::TempFail,
            DcpError::TooBig => Status::TooBig,
            DcpError::SequenceInvariant { .. } => Status::Failed,
            DcpError::OutOfRange { .. } => Status::OutOfRange,
            DcpError::Disconnect => Status::Disconnect,
            DcpError::NotSupported { .. } => Status::NotSupported,
            DcpError::Store(e) => e.status(),
            DcpError::Value(_) => Status::Failed,
        }
    }
}
