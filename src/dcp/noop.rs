//! Producer keepalive: periodic noops and the idle-peer deadline.

use crate::core::Limits;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoopDecision {
    /// A noop is due; send it and call [`NoopContext::mark_sent`].
    Send,
    /// A noop is outstanding; nothing new to send.
    Pending,
    NotDue,
}

#[derive(Clone, Debug)]
pub struct NoopContext {
    enabled: bool,
    interval_ms: u64,
    idle_timeout_ms: u64,
    next_send_ms: u64,
    last_receive_ms: u64,
    pending_recv: bool,
    opaque: u32,
}

impl NoopContext {
    pub fn new(limits: &Limits, now_ms: u64) -> Self {
        Self {
            enabled: false,
            interval_ms: limits.noop_interval_ms,
            idle_timeout_ms: limits.idle_timeout_ms,
            next_send_ms: now_ms,
            last_receive_ms: now_ms,
            pending_recv: false,
            opaque: 0x1000_0000,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_interval_ms(&mut self, interval_ms: u64) {
        self.interval_ms = interval_ms;
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn is_pending(&self) -> bool {
        self.pending_recv
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn last_receive_ms(&self) -> u64 {
        self.last_receive_ms
    }

    pub fn poll(&self, now_ms: u64) -> NoopDecision {
        if !self.enabled {
            return NoopDecision::NotDue;
        }
        if self.pending_recv {
            return NoopDecision::Pending;
        }
        if now_ms >= self.next_send_ms {
            NoopDecision::Send
        } else {
            NoopDecision::NotDue
        }
    }

    pub fn mark_sent(&mut self, now_ms: u64) {
        self.pending_recv = true;
        self.next_send_ms = now_ms.saturating_add(self.interval_ms);
    }

    /// Any message from the peer counts as liveness.
    pub fn note_recv(&mut self, now_ms: u64) {
        self.last_receive_ms = now_ms;
    }

    /// The peer answered our noop.
    pub fn acknowledge(&mut self, now_ms: u64) {
        self.pending_recv = false;
        self.last_receive_ms = now_ms;
    }

    /// True when a noop has gone unanswered past the idle timeout.
    pub fn should_disconnect(&self, now_ms: u64) -> bool {
        self.enabled
            && self.pending_recv
            && now_ms.saturating_sub(self.last_receive_ms) > self.idle_timeout_ms
    }
}
