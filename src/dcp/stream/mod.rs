//! Per-vbucket stream state machines.
//!
//! - active: the producer side, reading a cursor (and disk for backfill)
//! - passive: the consumer side, applying and buffering incoming messages
//! - value: turning cached items into wire responses

pub mod active;
pub mod passive;
pub mod value;

use std::fmt;

pub use active::{ActiveStream, BackfillProgress, StreamPoll, StreamRequest};
pub use passive::{PassiveStream, ProcessResult};
pub use value::{IncludeDeleteTime, IncludeValue, IncludeXattrs, ResponseOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamState {
    Pending,
    Backfilling,
    InMemory,
    TakeoverSend,
    TakeoverWait,
    Reading,
    Dead,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Pending => "pending",
            StreamState::Backfilling => "backfilling",
            StreamState::InMemory => "in_memory",
            StreamState::TakeoverSend => "takeover_send",
            StreamState::TakeoverWait => "takeover_wait",
            StreamState::Reading => "reading",
            StreamState::Dead => "dead",
        }
    }

    pub fn is_dead(self) -> bool {
        matches!(self, StreamState::Dead)
    }

    /// Transitions an active stream may take.
    pub(crate) fn active_can_move_to(self, next: StreamState) -> bool {
        use StreamState::*;
        match (self, next) {
            (_, Dead) => true,
            (Pending, Backfilling | InMemory) => true,
            (Backfilling, InMemory | TakeoverSend) => true,
            (InMemory, TakeoverSend) => true,
            (TakeoverSend, TakeoverWait) => true,
            (TakeoverWait, TakeoverSend) => true,
            _ => false,
        }
    }

    /// Transitions a passive stream may take.
    pub(crate) fn passive_can_move_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!((self, next), (_, Dead) | (Pending, Reading))
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Highest seqno a stream has seen; may only move forward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeqnoWatermark {
    last: u64,
}

impl SeqnoWatermark {
    pub fn new(start: u64) -> Self {
        Self { last: start }
    }

    pub fn get(self) -> u64 {
        self.last
    }

    /// Record `seqno`; returns the previous watermark if it would go backwards.
    pub fn observe(&mut self, seqno: u64) -> Result<(), u64> {
        if seqno < self.last {
            return Err(self.last);
        }
        self.last = seqno;
        Ok(())
    }

    /// Reset after a rollback.
    pub fn reset(&mut self, seqno: u64) {
        self.last = seqno;
    }
}
