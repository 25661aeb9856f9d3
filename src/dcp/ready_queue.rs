use std::collections::{HashSet, VecDeque};

use crate::core::Vbid;

use super::message::DcpResponse;

/// Outbound messages a stream has produced but the connection has not sent.
///
/// Byte accounting lets the checkpoint processor stop pulling once the
/// queue holds `max_bytes`; pushes themselves are never refused.
#[derive(Debug)]
pub struct ReadyQueue {
    messages: VecDeque<DcpResponse>,
    max_bytes: usize,
    total_bytes: usize,
}

impl ReadyQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            max_bytes: max_bytes.max(1),
            total_bytes: 0,
        }
    }

    pub fn push(&mut self, msg: DcpResponse) {
        self.total_bytes += msg.message_size();
        self.messages.push_back(msg);
    }

    pub fn pop(&mut self) -> Option<DcpResponse> {
        let msg = self.messages.pop_front()?;
        let len = msg.message_size();
        debug_assert!(self.total_bytes >= len, "ready queue bytes underflow");
        self.total_bytes = self.total_bytes.saturating_sub(len);
        Some(msg)
    }

    pub fn front(&self) -> Option<&DcpResponse> {
        self.messages.front()
    }

    pub fn has_capacity(&self) -> bool {
        self.total_bytes < self.max_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.total_bytes = 0;
    }
}

/// Vbuckets a connection should visit next, each at most once, in FIFO order.
#[derive(Debug, Default)]
pub struct VbReadyList {
    order: VecDeque<Vbid>,
    members: HashSet<Vbid>,
}

impl VbReadyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `vbid` was already queued.
    pub fn push(&mut self, vbid: Vbid) -> bool {
        if !self.members.insert(vbid) {
            return false;
        }
        self.order.push_back(vbid);
        true
    }

    pub fn pop(&mut self) -> Option<Vbid> {
        let vbid = self.order.pop_front()?;
        self.members.remove(&vbid);
        Some(vbid)
    }

    pub fn remove(&mut self, vbid: Vbid) {
        if self.members.remove(&vbid) {
            self.order.retain(|v| *v != vbid);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}
