//! Failover log: the (uuid, seqno) history used to validate resumption.
//!
//! Entries are kept newest first. Each entry marks the seqno at which a new
//! branch of history began; a peer resuming from (uuid, seqno) can continue
//! only if its snapshot lies entirely on a branch we still share.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailoverEntry {
    pub vb_uuid: u64,
    pub by_seqno: u64,
}

/// Resumption point presented by a peer on stream request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeRequest {
    pub start_seqno: u64,
    pub vb_uuid: u64,
    pub snap_start: u64,
    pub snap_end: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverTable {
    entries: VecDeque<FailoverEntry>,
    max_entries: usize,
}

impl FailoverTable {
    /// Fresh table with a single branch starting at seqno 0.
    pub fn new(max_entries: usize) -> Self {
        let mut table = Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
        };
        table.create_entry(0);
        table
    }

    pub fn from_entries(entries: Vec<FailoverEntry>, max_entries: usize) -> Self {
        let mut table = Self {
            entries: entries.into_iter().collect(),
            max_entries: max_entries.max(1),
        };
        table.entries.truncate(table.max_entries);
        table
    }

    pub fn latest(&self) -> Option<FailoverEntry> {
        self.entries.front().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FailoverEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start a new branch at `high_seqno` with a random uuid.
    pub fn create_entry(&mut self, high_seqno: u64) -> FailoverEntry {
        let (hi, lo) = Uuid::new_v4().as_u64_pair();
        let mut vb_uuid = hi ^ lo;
        while vb_uuid == 0 || self.entries.iter().any(|e| e.vb_uuid == vb_uuid) {
            vb_uuid = vb_uuid.wrapping_add(1);
        }
        let entry = FailoverEntry {
            vb_uuid,
            by_seqno: high_seqno,
        };
        self.add_entry(entry);
        entry
    }

    /// Record a branch point. Entries beyond `entry.by_seqno` describe
    /// history that no longer exists and are discarded.
    pub fn add_entry(&mut self, entry: FailoverEntry) {
        self.entries.retain(|e| e.by_seqno <= entry.by_seqno);
        self.entries.push_front(entry);
        self.entries.truncate(self.max_entries);
    }

    /// Entries whose branch covers seqnos at or after `seqno`, newest first.
    pub fn entries_since(&self, seqno: u64) -> Vec<FailoverEntry> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.push(*entry);
            if entry.by_seqno <= seqno {
                break;
            }
        }
        out
    }

    /// Drop branches that start after `seqno` (after a rollback).
    pub fn prune_after(&mut self, seqno: u64) {
        self.entries.retain(|e| e.by_seqno <= seqno);
        if self.entries.is_empty() {
            self.create_entry(seqno);
        }
    }

    /// Decide whether a resumption point is reachable.
    ///
    /// Returns `Some(rollback_seqno)` when the peer must first roll back.
    pub fn needs_rollback(
        &self,
        req: &ResumeRequest,
        high_seqno: u64,
        purge_seqno: u64,
    ) -> Option<u64> {
        if req.start_seqno == 0 {
            return None;
        }
        if req.start_seqno < purge_seqno {
            return Some(0);
        }

        // A peer that sits exactly on its snapshot end holds a complete
        // snapshot, so only the start seqno has to be on our branch.
        let (snap_start, snap_end) = if req.start_seqno == req.snap_end {
            (req.start_seqno, req.start_seqno)
        } else {
            (req.snap_start, req.snap_end)
        };

        let mut upper = high_seqno;
        for entry in &self.entries {
            if entry.vb_uuid == req.vb_uuid {
                if snap_end <= upper {
                    return None;
                }
                return Some(snap_start.min(upper));
            }
            upper = entry.by_seqno;
        }
        Some(0)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.entries
                .iter()
                .map(|e| serde_json::json!({ "id": e.vb_uuid, "seq": e.by_seqno }))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(u64, u64)]) -> FailoverTable {
        FailoverTable::from_entries(
            entries
                .iter()
                .map(|&(vb_uuid, by_seqno)| FailoverEntry { vb_uuid, by_seqno })
                .collect(),
            25,
        )
    }

    fn req(start: u64, vb_uuid: u64, snap_start: u64, snap_end: u64) -> ResumeRequest {
        ResumeRequest {
            start_seqno: start,
            vb_uuid,
            snap_start,
            snap_end,
        }
    }

    #[test]
    fn fresh_start_never_rolls_back() {
        let table = table(&[(7, 0)]);
        assert_eq!(table.needs_rollback(&req(0, 0, 0, 0), 100, 0), None);
    }

    #[test]
    fn resume_on_current_branch_is_accepted() {
        let table = table(&[(9, 50), (7, 0)]);
        assert_eq!(table.needs_rollback(&req(80, 9, 80, 80), 100, 0), None);
        assert_eq!(table.needs_rollback(&req(40, 7, 40, 40), 100, 0), None);
    }

    #[test]
    fn resume_past_branch_point_rolls_back() {
        let table = table(&[(9, 50), (7, 0)]);
        // Peer followed uuid 7 up to 60, but our history diverged at 50.
        assert_eq!(table.needs_rollback(&req(60, 7, 55, 60), 100, 0), Some(50));
        assert_eq!(table.needs_rollback(&req(45, 7, 40, 70), 100, 0), Some(40));
    }

    #[test]
    fn unknown_uuid_or_purged_range_rolls_back_to_zero() {
        let table = table(&[(9, 50)]);
        assert_eq!(table.needs_rollback(&req(60, 1234, 60, 60), 100, 0), Some(0));
        assert_eq!(table.needs_rollback(&req(60, 9, 60, 60), 100, 70), Some(0));
    }

    #[test]
    fn add_entry_discards_diverged_history() {
        let mut table = table(&[(9, 50), (7, 0)]);
        table.add_entry(FailoverEntry {
            vb_uuid: 11,
            by_seqno: 30,
        });
        let uuids: Vec<u64> = table.entries().map(|e| e.vb_uuid).collect();
        assert_eq!(uuids, vec![11, 7]);
    }

    #[test]
    fn entries_since_includes_covering_branch() {
        let table = table(&[(11, 90), (9, 50), (7, 0)]);
        let since: Vec<u64> = table.entries_since(60).iter().map(|e| e.vb_uuid).collect();
        assert_eq!(since, vec![11, 9]);
    }

    #[test]
    fn create_entry_uses_unique_nonzero_uuid() {
        let mut table = FailoverTable::new(3);
        let first = table.latest().expect("entry");
        let second = table.create_entry(10);
        assert_ne!(first.vb_uuid, second.vb_uuid);
        assert_ne!(second.vb_uuid, 0);
        assert_eq!(table.latest(), Some(second));
    }
}
