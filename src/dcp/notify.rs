//! Deferred wakeups for paused connections.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::{Cookie, Status};

/// The transport's notify-completion callback.
pub trait IoNotifier: Send + Sync {
    fn notify_io_complete(&self, cookie: Cookie, status: Status);
}

/// Default notifier for hosts that poll instead of waiting for callbacks.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl IoNotifier for TracingNotifier {
    fn notify_io_complete(&self, cookie: Cookie, status: Status) {
        tracing::trace!(?cookie, ?status, "notify io complete");
    }
}

/// Records every callback; used by tests and simulations.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(Cookie, Status)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(Cookie, Status)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, cookie: Cookie) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(c, _)| *c == cookie)
            .count()
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl IoNotifier for RecordingNotifier {
    fn notify_io_complete(&self, cookie: Cookie, status: Status) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((cookie, status));
    }
}

/// Cookies of connections that became runnable while paused.
///
/// A cookie is queued at most once until the next drain; the directory drops
/// the entry at delivery time if the connection is no longer paused.
#[derive(Debug, Default)]
pub struct PendingNotifications {
    inner: Mutex<PendingQueue>,
}

#[derive(Debug, Default)]
struct PendingQueue {
    order: VecDeque<Cookie>,
    queued: HashSet<Cookie>,
}

impl PendingNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `cookie` was already waiting.
    pub fn push(&self, cookie: Cookie) -> bool {
        let mut inner = self.lock();
        if !inner.queued.insert(cookie) {
            return false;
        }
        inner.order.push_back(cookie);
        true
    }

    pub fn drain(&self) -> Vec<Cookie> {
        let mut inner = self.lock();
        inner.queued.clear();
        inner.order.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, PendingQueue> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
