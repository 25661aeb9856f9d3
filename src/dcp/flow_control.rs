//! Byte-window flow control for both ends of a connection.
//!
//! The producer side ([`BufferLog`]) stops sending once the peer has the
//! whole window unacknowledged. The consumer side ([`FlowControl`]) counts
//! bytes as they are applied and acknowledges them in batches.

use crate::config::FlowControlPolicy;
use crate::core::Limits;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferLogState {
    Disabled,
    Full,
    SpaceAvailable,
}

/// Producer-side record of bytes sent but not yet acknowledged.
#[derive(Debug, Default)]
pub struct BufferLog {
    max_bytes: usize,
    outstanding: usize,
    acked_total: u64,
}

impl BufferLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the window advertised by the peer; 0 disables flow control.
    pub fn set_buffer_size(&mut self, bytes: usize) {
        self.max_bytes = bytes;
        if bytes == 0 {
            self.outstanding = 0;
        }
    }

    pub fn state(&self) -> BufferLogState {
        if self.max_bytes == 0 {
            BufferLogState::Disabled
        } else if self.outstanding >= self.max_bytes {
            BufferLogState::Full
        } else {
            BufferLogState::SpaceAvailable
        }
    }

    pub fn is_full(&self) -> bool {
        self.state() == BufferLogState::Full
    }

    pub fn insert(&mut self, bytes: usize) {
        if self.max_bytes > 0 {
            self.outstanding += bytes;
        }
    }

    /// Returns true when the acknowledgement reopened a full window.
    pub fn acknowledge(&mut self, bytes: usize) -> bool {
        let was_full = self.is_full();
        self.outstanding = self.outstanding.saturating_sub(bytes);
        self.acked_total += bytes as u64;
        was_full && !self.is_full()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn acked_total(&self) -> u64 {
        self.acked_total
    }
}

/// Consumer-side window bookkeeping.
#[derive(Debug)]
pub struct FlowControl {
    policy: FlowControlPolicy,
    window_bytes: usize,
    ack_threshold_bytes: usize,
    ack_interval_ms: u64,
    freed_bytes: usize,
    received_bytes: u64,
    freed_total: u64,
    last_ack_ms: u64,
    window_announced: bool,
}

impl FlowControl {
    pub fn new(policy: FlowControlPolicy, limits: &Limits, now_ms: u64) -> Self {
        let window_bytes = limits.flow_control_window_bytes;
        Self {
            policy,
            window_bytes,
            ack_threshold_bytes: limits.buffer_ack_threshold_bytes(window_bytes).max(1),
            ack_interval_ms: limits.buffer_ack_interval_ms,
            freed_bytes: 0,
            received_bytes: 0,
            freed_total: 0,
            last_ack_ms: now_ms,
            window_announced: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.is_enabled()
    }

    pub fn window_bytes(&self) -> usize {
        self.window_bytes
    }

    /// The window to announce through `connection_buffer_size`, once.
    pub fn take_window_announcement(&mut self) -> Option<usize> {
        if !self.is_enabled() || self.window_announced {
            return None;
        }
        self.window_announced = true;
        Some(self.window_bytes)
    }

    pub fn note_received(&mut self, bytes: usize) {
        self.received_bytes += bytes as u64;
    }

    pub fn note_freed(&mut self, bytes: usize) {
        self.freed_total += bytes as u64;
        if self.is_enabled() {
            self.freed_bytes += bytes;
        }
    }

    /// Whether `take_buffer_ack` would produce an acknowledgement now.
    pub fn ack_due(&self, now_ms: u64) -> bool {
        if !self.is_enabled() || self.freed_bytes == 0 {
            return false;
        }
        self.freed_bytes >= self.ack_threshold_bytes
            || now_ms.saturating_sub(self.last_ack_ms) >= self.ack_interval_ms
    }

    /// Bytes to acknowledge now, if the threshold or the interval says so.
    pub fn take_buffer_ack(&mut self, now_ms: u64) -> Option<u32> {
        if !self.ack_due(now_ms) {
            return None;
        }
        self.last_ack_ms = now_ms;
        let bytes = std::mem::take(&mut self.freed_bytes);
        Some(u32::try_from(bytes).unwrap_or(u32::MAX))
    }

    pub fn freed_bytes(&self) -> usize {
        self.freed_bytes
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Every byte ever freed, acknowledged or not.
    pub fn freed_total(&self) -> u64 {
        self.freed_total
    }
}
