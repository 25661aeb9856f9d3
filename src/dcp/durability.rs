//! Sequence acknowledgements for synchronous replication.
//!
//! Each passive stream tracks two watermarks: the highest durable write
//! received in memory and the highest durable write covered by a flush. Both
//! only ever name prepares, so `on_disk <= in_memory`. An acknowledgement is
//! produced whenever the pair moves, and never twice for the same pair.

use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqnoAck {
    pub in_memory_seqno: u64,
    pub on_disk_seqno: u64,
}

#[derive(Debug, Default)]
pub struct DurabilityAcker {
    in_memory_seqno: u64,
    on_disk_seqno: u64,
    unpersisted_prepares: VecDeque<u64>,
    last_acked: Option<SeqnoAck>,
}

impl DurabilityAcker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A durable write was stored in memory.
    pub fn prepare_received(&mut self, seqno: u64) -> Option<SeqnoAck> {
        if seqno <= self.in_memory_seqno {
            return None;
        }
        self.in_memory_seqno = seqno;
        self.unpersisted_prepares.push_back(seqno);
        self.emit()
    }

    /// The flusher persisted everything up to `seqno`.
    pub fn persisted(&mut self, seqno: u64) -> Option<SeqnoAck> {
        let mut covered = None;
        while let Some(&front) = self.unpersisted_prepares.front() {
            if front > seqno {
                break;
            }
            self.unpersisted_prepares.pop_front();
            covered = Some(front);
        }
        let prepare = covered?;
        self.on_disk_seqno = self.on_disk_seqno.max(prepare);
        self.emit()
    }

    /// End of a snapshot. Every prepare was already acknowledged on apply,
    /// so this only reports a pair that somehow has not been sent.
    pub fn snapshot_end(&mut self) -> Option<SeqnoAck> {
        if self.in_memory_seqno == 0 {
            return None;
        }
        self.emit()
    }

    pub fn in_memory_seqno(&self) -> u64 {
        self.in_memory_seqno
    }

    pub fn on_disk_seqno(&self) -> u64 {
        self.on_disk_seqno
    }

    pub fn last_acked(&self) -> Option<SeqnoAck> {
        self.last_acked
    }

    fn emit(&mut self) -> Option<SeqnoAck> {
        let ack = SeqnoAck {
            in_memory_seqno: self.in_memory_seqno,
            on_disk_seqno: self.on_disk_seqno,
        };
        if self.last_acked == Some(ack) {
            return None;
        }
        self.last_acked = Some(ack);
        Some(ack)
    }
}
