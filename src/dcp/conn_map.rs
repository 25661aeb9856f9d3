//! Connection directory.
//!
//! Holds every live connection by cookie, with name and vbucket indices on
//! the side. A disconnected connection moves to the dead list and is only
//! dropped by [`DcpConnMap::manage_connections`] once the transport has let
//! go of it. Wakeups for paused connections are queued by the connections
//! themselves and delivered here, outside the directory lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::{Cookie, Status, VBucketState, Vbid};
use crate::metrics;

use super::connection::DcpConnection;
use super::consumer::DcpConsumer;
use super::context::EngineContext;
use super::message::EndStreamReason;
use super::producer::DcpProducer;

const NAME_PREFIX: &str = "eq_dcpq:";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnMapStats {
    pub live: usize,
    pub dead: usize,
    pub pending: usize,
}

#[derive(Default)]
struct MapInner {
    by_cookie: HashMap<Cookie, DcpConnection>,
    by_name: HashMap<String, Cookie>,
    vb_conns: BTreeMap<Vbid, Vec<Cookie>>,
    dead: Vec<DcpConnection>,
    shutting_down: bool,
}

pub struct DcpConnMap {
    ctx: Arc<EngineContext>,
    inner: Mutex<MapInner>,
}

/// Directory name for a peer-supplied connection name.
pub fn conn_name(name: &str) -> String {
    format!("{NAME_PREFIX}{name}")
}

impl DcpConnMap {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            inner: Mutex::new(MapInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MapInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn new_producer(&self, cookie: Cookie, name: &str, flags: u32) -> Option<Arc<DcpProducer>> {
        let name = conn_name(name);
        let mut inner = self.lock();
        if !self.admit(&inner, cookie, &name) {
            return None;
        }
        let producer = DcpProducer::new(Arc::clone(&self.ctx), cookie, name.clone(), flags);
        inner
            .by_cookie
            .insert(cookie, DcpConnection::Producer(Arc::clone(&producer)));
        inner.by_name.insert(name, cookie);
        Some(producer)
    }

    pub fn new_consumer(&self, cookie: Cookie, name: &str) -> Option<Arc<DcpConsumer>> {
        let name = conn_name(name);
        let mut inner = self.lock();
        if !self.admit(&inner, cookie, &name) {
            return None;
        }
        let consumer = DcpConsumer::new(Arc::clone(&self.ctx), cookie, name.clone());
        inner
            .by_cookie
            .insert(cookie, DcpConnection::Consumer(Arc::clone(&consumer)));
        inner.by_name.insert(name, cookie);
        Some(consumer)
    }

    /// Registration checks shared by both kinds. Evicts a live connection
    /// with the same name.
    fn admit(&self, inner: &MapInner, cookie: Cookie, name: &str) -> bool {
        if inner.shutting_down {
            tracing::warn!(name, "directory shutting down; refusing connection");
            return false;
        }
        if let Some(existing) = inner.by_cookie.get(&cookie) {
            tracing::warn!(
                ?cookie,
                name,
                existing = existing.handler().name(),
                "cookie already registered; disconnecting existing connection"
            );
            existing.handler().set_disconnect();
            return false;
        }
        if let Some(old_cookie) = inner.by_name.get(name).copied()
            && let Some(old) = inner.by_cookie.get(&old_cookie)
        {
            tracing::info!(
                name,
                old = ?old_cookie,
                new = ?cookie,
                "duplicate connection name; evicting older connection"
            );
            old.handler().set_disconnect();
        }
        true
    }

    /// Live connection registered under `name`, excluding any marked for
    /// disconnect.
    pub fn find_by_name(&self, name: &str) -> Option<DcpConnection> {
        let name = conn_name(name);
        let inner = self.lock();
        let cookie = inner.by_name.get(&name)?;
        inner
            .by_cookie
            .get(cookie)
            .filter(|conn| !conn.handler().wants_disconnect())
            .cloned()
    }

    pub fn find_by_cookie(&self, cookie: Cookie) -> Option<DcpConnection> {
        self.lock().by_cookie.get(&cookie).cloned()
    }

    /// Index `cookie` as serving `vbid`.
    pub fn add_vb_conn(&self, vbid: Vbid, cookie: Cookie) {
        let mut inner = self.lock();
        let conns = inner.vb_conns.entry(vbid).or_default();
        if !conns.contains(&cookie) {
            conns.push(cookie);
        }
    }

    /// Move the connection to the dead list and close its streams. Safe to
    /// call more than once.
    pub fn disconnect(&self, cookie: Cookie) {
        let conn = {
            let mut inner = self.lock();
            let Some(conn) = inner.by_cookie.remove(&cookie) else {
                return;
            };
            let name = conn.handler().name();
            if inner.by_name.get(name) == Some(&cookie) {
                inner.by_name.remove(name);
            }
            inner.vb_conns.retain(|_, conns| {
                conns.retain(|c| *c != cookie);
                !conns.is_empty()
            });
            conn
        };
        conn.handler().set_disconnect();
        conn.close_all_streams(EndStreamReason::Disconnected);
        tracing::info!(
            parent: conn.handler().span(),
            kind = conn.kind().as_str(),
            "connection moved to dead list"
        );
        self.lock().dead.push(conn);
    }

    /// Periodic sweep: liveness, disconnects, reaping and wakeups.
    pub fn manage_connections(&self) {
        let now = self.ctx.now_ms();
        let live: Vec<DcpConnection> = self.lock().by_cookie.values().cloned().collect();
        let mut doomed = Vec::new();
        for conn in &live {
            conn.check_liveness(now);
            if conn.handler().wants_disconnect() {
                doomed.push(conn.handler().cookie());
            }
        }
        drop(live);
        for cookie in doomed {
            self.disconnect(cookie);
            self.ctx.notifier.notify_io_complete(cookie, Status::Disconnect);
        }

        let (reaped, lingering) = {
            let mut inner = self.lock();
            let before = inner.dead.len();
            inner.dead.retain(|conn| conn.strong_count() > 1);
            let lingering: Vec<Cookie> = inner
                .dead
                .iter()
                .map(|conn| conn.handler().cookie())
                .collect();
            (before - inner.dead.len(), lingering)
        };
        if reaped > 0 {
            tracing::debug!(reaped, "reaped dead connections");
            metrics::connections_reaped(reaped);
        }
        // Still referenced by the transport; wake it so it lets go.
        for cookie in &lingering {
            self.ctx.notifier.notify_io_complete(*cookie, Status::Disconnect);
        }
        metrics::set_dead_connections(lingering.len());

        self.process_pending_notifications();
    }

    /// Queue a wakeup for `cookie`; delivered only if still paused. Repeated
    /// calls before the next delivery collapse into one.
    pub fn add_connection_to_pending(&self, cookie: Cookie) {
        if !self.ctx.pending.push(cookie) {
            tracing::trace!(?cookie, "wakeup already pending");
        }
    }

    /// Deliver queued wakeups. Each queued cookie produces at most one
    /// callback, and none if the connection has resumed or gone.
    pub fn process_pending_notifications(&self) {
        let cookies = self.ctx.pending.drain();
        if cookies.is_empty() {
            return;
        }
        let targets: Vec<Cookie> = {
            let inner = self.lock();
            cookies
                .into_iter()
                .filter(|cookie| {
                    inner
                        .by_cookie
                        .get(cookie)
                        .is_some_and(|conn| conn.handler().is_paused())
                })
                .collect()
        };
        for cookie in targets {
            self.ctx.notifier.notify_io_complete(cookie, Status::Success);
        }
    }

    /// Mark every connection for disconnect, close all streams and refuse
    /// further opens.
    pub fn shutdown_all_connections(&self) {
        let conns: Vec<DcpConnection> = {
            let mut inner = self.lock();
            inner.shutting_down = true;
            inner.by_cookie.values().cloned().collect()
        };
        tracing::info!(connections = conns.len(), "shutting down all connections");
        for conn in &conns {
            conn.handler().set_disconnect();
            conn.close_all_streams(EndStreamReason::Disconnected);
            self.ctx
                .notifier
                .notify_io_complete(conn.handler().cookie(), Status::Disconnect);
        }
    }

    /// End producer streams for a vbucket that left the active state.
    pub fn vbucket_state_changed(&self, vbid: Vbid, state: VBucketState) {
        for conn in self.vb_connections(vbid) {
            if let Some(producer) = conn.as_producer() {
                producer.vbucket_state_changed(vbid, state);
            }
        }
    }

    /// New items on `vbid`: wake the producers streaming it.
    pub fn notify_vb_connections(&self, vbid: Vbid, seqno: u64) {
        for conn in self.vb_connections(vbid) {
            if let Some(producer) = conn.as_producer() {
                producer.notify_seqno_available(vbid, seqno);
            }
        }
    }

    /// The flusher persisted `vbid` up to `seqno`.
    pub fn seqno_persisted(&self, vbid: Vbid, seqno: u64) {
        let consumers: Vec<Arc<DcpConsumer>> = {
            let inner = self.lock();
            inner
                .by_cookie
                .values()
                .filter_map(|conn| conn.as_consumer())
                .filter(|consumer| consumer.stream(vbid).is_some())
                .cloned()
                .collect()
        };
        for consumer in consumers {
            consumer.seqno_persisted(vbid, seqno);
        }
    }

    pub fn stats(&self) -> ConnMapStats {
        let inner = self.lock();
        ConnMapStats {
            live: inner.by_cookie.len(),
            dead: inner.dead.len(),
            pending: self.ctx.pending.len(),
        }
    }

    pub fn dead_connections(&self) -> usize {
        self.lock().dead.len()
    }

    fn vb_connections(&self, vbid: Vbid) -> Vec<DcpConnection> {
        let inner = self.lock();
        inner
            .vb_conns
            .get(&vbid)
            .into_iter()
            .flatten()
            .filter_map(|cookie| inner.by_cookie.get(cookie).cloned())
            .collect()
    }
}

impl std::fmt::Debug for DcpConnMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpConnMap")
            .field("stats", &self.stats())
            .finish()
    }
}
