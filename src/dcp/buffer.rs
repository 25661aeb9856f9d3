use std::collections::VecDeque;

use super::message::DcpResponse;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferFull {
    pub items: usize,
    pub bytes: usize,
    pub rejected_bytes: usize,
}

/// Inbound messages a passive stream accepted but has not applied yet.
///
/// Unlike an outbound queue nothing may be dropped here: the peer will not
/// resend, so a full buffer rejects the newcomer and leaves the rest intact.
#[derive(Debug)]
pub struct PassiveBuffer {
    messages: VecDeque<DcpResponse>,
    max_items: usize,
    max_bytes: usize,
    total_bytes: usize,
}

impl PassiveBuffer {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            max_items: max_items.max(1),
            max_bytes: max_bytes.max(1),
            total_bytes: 0,
        }
    }

    pub fn push(&mut self, msg: DcpResponse) -> Result<(), BufferFull> {
        let bytes = msg.message_size();
        if self.messages.len() >= self.max_items || self.total_bytes + bytes > self.max_bytes {
            return Err(BufferFull {
                items: self.messages.len(),
                bytes: self.total_bytes,
                rejected_bytes: bytes,
            });
        }
        self.total_bytes += bytes;
        self.messages.push_back(msg);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<DcpResponse> {
        let msg = self.messages.pop_front()?;
        let len = msg.message_size();
        debug_assert!(self.total_bytes >= len, "buffer bytes underflow");
        self.total_bytes = self.total_bytes.saturating_sub(len);
        Some(msg)
    }

    /// Put back a message that could not be applied; it stays first in line.
    pub fn push_front(&mut self, msg: DcpResponse) {
        self.total_bytes += msg.message_size();
        self.messages.push_front(msg);
    }

    pub fn front_size(&self) -> Option<usize> {
        self.messages.front().map(DcpResponse::message_size)
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

    /// Discard everything, returning the bytes released.
    pub fn clear(&mut self) -> usize {
        self.messages.clear();
        std::mem::take(&mut self.total_bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::{Item, Vbid};

    fn mutation(seqno: u64, value_len: usize) -> DcpResponse {
        let item = Item::mutation(Vbid::new(0), "k", vec![0u8; value_len], seqno);
        DcpResponse::from_item(1, Arc::new(item), false)
    }

    #[test]
    fn full_buffer_rejects_newcomer_without_dropping() {
        let mut buffer = PassiveBuffer::new(2, 1024);
        buffer.push(mutation(1, 10)).expect("first");
        buffer.push(mutation(2, 10)).expect("second");

        let full = buffer.push(mutation(3, 10)).unwrap_err();
        assert_eq!(full.items, 2);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.pop().and_then(|m| m.by_seqno()), Some(1));
    }

    #[test]
    fn byte_limit_applies() {
        let mut buffer = PassiveBuffer::new(100, 80);
        buffer.push(mutation(1, 10)).expect("fits");
        let full = buffer.push(mutation(2, 10)).unwrap_err();
        assert_eq!(full.rejected_bytes, mutation(2, 10).message_size());
    }

    #[test]
    fn push_front_keeps_order_and_bytes() {
        let mut buffer = PassiveBuffer::new(10, 1024);
        buffer.push(mutation(1, 0)).expect("push");
        buffer.push(mutation(2, 0)).expect("push");
        let first = buffer.pop().expect("pop");
        let bytes = buffer.bytes();
        buffer.push_front(first);
        assert_eq!(buffer.bytes(), bytes + mutation(1, 0).message_size());
        assert_eq!(buffer.pop().and_then(|m| m.by_seqno()), Some(1));
        assert_eq!(buffer.clear(), mutation(2, 0).message_size());
        assert!(buffer.is_empty());
    }
}
