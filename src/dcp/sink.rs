//! Transport seam: where connections hand protocol messages to the wire.

use thiserror::Error;

use super::message::DcpResponse;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    /// Transport buffers are full; offer the same message again later.
    #[error("transport would block")]
    WouldBlock,
    #[error("message exceeds the transport's size limit")]
    TooBig,
    #[error("transport disconnected")]
    Disconnected,
}

/// Emits protocol messages on behalf of a connection.
///
/// The message is borrowed: on `WouldBlock` the caller still owns it and
/// offers it again first on the next step.
pub trait MessageSink: Send {
    fn send(&mut self, msg: &DcpResponse) -> Result<(), SinkError>;
}

/// Sink that records every accepted message.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Vec<DcpResponse>,
    block_next: usize,
    max_message_size: Option<usize>,
    disconnected: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` sends with `WouldBlock`.
    pub fn block_next(&mut self, count: usize) {
        self.block_next = count;
    }

    /// Refuse any message larger than `bytes` with `TooBig`.
    pub fn limit_message_size(&mut self, bytes: usize) {
        self.max_message_size = Some(bytes);
    }

    pub fn disconnect(&mut self) {
        self.disconnected = true;
    }

    pub fn sent(&self) -> &[DcpResponse] {
        &self.sent
    }

    pub fn last(&self) -> Option<&DcpResponse> {
        self.sent.last()
    }

    pub fn take(&mut self) -> Vec<DcpResponse> {
        std::mem::take(&mut self.sent)
    }

    /// Seqnos of every item-bearing message, in send order.
    pub fn seqnos(&self) -> Vec<u64> {
        self.sent.iter().filter_map(DcpResponse::by_seqno).collect()
    }
}

impl MessageSink for RecordingSink {
    fn send(&mut self, msg: &DcpResponse) -> Result<(), SinkError> {
        if self.disconnected {
            return Err(SinkError::Disconnected);
        }
        if self.block_next > 0 {
            self.block_next -= 1;
            return Err(SinkError::WouldBlock);
        }
        if let Some(max) = self.max_message_size
            && msg.message_size() > max
        {
            return Err(SinkError::TooBig);
        }
        self.sent.push(msg.clone());
        Ok(())
    }
}
