//! State shared by producer and consumer connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::Span;

use crate::core::Cookie;

use super::consumer::DcpConsumer;
use super::error::DcpError;
use super::message::{DcpResponse, EndStreamReason};
use super::notify::PendingNotifications;
use super::producer::DcpProducer;
use super::sink::{MessageSink, SinkError};

/// Result of one `step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// A message was handed to the sink.
    Sent,
    /// Nothing to send right now; the connection is paused and will be
    /// notified when that changes.
    WouldBlock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnKind {
    Producer,
    Consumer,
}

impl ConnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnKind::Producer => "producer",
            ConnKind::Consumer => "consumer",
        }
    }
}

/// Identity, pause state and the retained would-block message.
pub struct ConnHandler {
    cookie: Cookie,
    name: String,
    kind: ConnKind,
    span: Span,
    paused: AtomicBool,
    disconnect: AtomicBool,
    rejected: Mutex<Option<DcpResponse>>,
    pending: Arc<PendingNotifications>,
}

impl ConnHandler {
    pub fn new(
        cookie: Cookie,
        name: impl Into<String>,
        kind: ConnKind,
        span: Span,
        pending: Arc<PendingNotifications>,
    ) -> Self {
        Self {
            cookie,
            name: name.into(),
            kind,
            span,
            paused: AtomicBool::new(true),
            disconnect: AtomicBool::new(false),
            rejected: Mutex::new(None),
            pending,
        }
    }

    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_disconnect(&self) {
        if !self.disconnect.swap(true, Ordering::AcqRel) {
            tracing::info!(parent: &self.span, "connection marked for disconnect");
        }
    }

    pub fn wants_disconnect(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    /// Queue a wakeup if the connection is parked.
    pub fn notify_paused(&self) {
        if self.is_paused() {
            self.pending.push(self.cookie);
        }
    }

    pub fn take_rejected(&self) -> Option<DcpResponse> {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Hand `msg` to the sink. A would-block keeps the message for the next
    /// step.
    pub fn send(&self, sink: &mut dyn MessageSink, msg: DcpResponse) -> Result<Step, DcpError> {
        match sink.send(&msg) {
            Ok(()) => Ok(Step::Sent),
            Err(SinkError::WouldBlock) => {
                *self.rejected.lock().unwrap_or_else(PoisonError::into_inner) = Some(msg);
                Ok(Step::WouldBlock)
            }
            Err(SinkError::TooBig) => Err(DcpError::TooBig),
            Err(SinkError::Disconnected) => {
                self.set_disconnect();
                Err(DcpError::Disconnect)
            }
        }
    }
}

impl std::fmt::Debug for ConnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandler")
            .field("cookie", &self.cookie)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("paused", &self.is_paused())
            .field("disconnect", &self.wants_disconnect())
            .finish()
    }
}

/// A registered connection. The directory holds these; callbacks from the
/// transport clone the inner `Arc` for the duration of a call.
#[derive(Clone)]
pub enum DcpConnection {
    Producer(Arc<DcpProducer>),
    Consumer(Arc<DcpConsumer>),
}

impl DcpConnection {
    pub fn handler(&self) -> &ConnHandler {
        match self {
            DcpConnection::Producer(p) => p.handler(),
            DcpConnection::Consumer(c) => c.handler(),
        }
    }

    pub fn kind(&self) -> ConnKind {
        self.handler().kind()
    }

    /// References held outside the directory's own slot.
    pub fn strong_count(&self) -> usize {
        match self {
            DcpConnection::Producer(p) => Arc::strong_count(p),
            DcpConnection::Consumer(c) => Arc::strong_count(c),
        }
    }

    pub fn step(&self, sink: &mut dyn MessageSink) -> Result<Step, DcpError> {
        match self {
            DcpConnection::Producer(p) => p.step(sink),
            DcpConnection::Consumer(c) => c.step(sink),
        }
    }

    pub fn close_all_streams(&self, reason: EndStreamReason) {
        match self {
            DcpConnection::Producer(p) => p.close_all_streams(reason),
            DcpConnection::Consumer(c) => c.close_all_streams(reason),
        }
    }

    /// Idle/keepalive check run by the directory sweep.
    pub fn check_liveness(&self, now_ms: u64) {
        match self {
            DcpConnection::Producer(p) => p.check_liveness(now_ms),
            DcpConnection::Consumer(c) => c.check_liveness(now_ms),
        }
    }

    pub fn as_producer(&self) -> Option<&Arc<DcpProducer>> {
        match self {
            DcpConnection::Producer(p) => Some(p),
            DcpConnection::Consumer(_) => None,
        }
    }

    pub fn as_consumer(&self) -> Option<&Arc<DcpConsumer>> {
        match self {
            DcpConnection::Consumer(c) => Some(c),
            DcpConnection::Producer(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcp::sink::RecordingSink;

    fn handler(pending: &Arc<PendingNotifications>) -> ConnHandler {
        ConnHandler::new(
            Cookie::new(1),
            "conn",
            ConnKind::Producer,
            Span::none(),
            Arc::clone(pending),
        )
    }

    #[test]
    fn would_block_retains_message() {
        let pending = Arc::new(PendingNotifications::new());
        let conn = handler(&pending);
        let mut sink = RecordingSink::new();
        sink.block_next(1);
        let msg = DcpResponse::Noop { opaque: 5 };
        assert_eq!(conn.send(&mut sink, msg.clone()), Ok(Step::WouldBlock));
        assert_eq!(conn.take_rejected(), Some(msg));
        assert_eq!(conn.take_rejected(), None);
    }

    #[test]
    fn disconnected_sink_marks_connection() {
        let pending = Arc::new(PendingNotifications::new());
        let conn = handler(&pending);
        let mut sink = RecordingSink::new();
        sink.disconnect();
        assert_eq!(
            conn.send(&mut sink, DcpResponse::Noop { opaque: 1 }),
            Err(DcpError::Disconnect)
        );
        assert!(conn.wants_disconnect());
    }

    #[test]
    fn only_paused_connections_are_queued() {
        let pending = Arc::new(PendingNotifications::new());
        let conn = handler(&pending);
        conn.notify_paused();
        conn.unpause();
        conn.notify_paused();
        assert_eq!(pending.drain(), vec![Cookie::new(1)]);
    }
}
