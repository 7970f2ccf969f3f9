//! ConnectionRegistry: the set of live connections across all listeners.
//!
//! Every accepted connection registers itself here and stays registered
//! until its [`ConnectionGuard`] drops. Plain and secure connections live in
//! separate sub-registries with their own id counters.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Waker;
use std::time::{Duration, Instant};

use futures::task::AtomicWaker;
use serde::Serialize;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Which listener a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Plain,
    Secure,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Secure => write!(f, "secure"),
        }
    }
}

/// Registry-assigned connection id, unique within its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Per-connection handle ───────────────────────────────────────────

struct HandleInner {
    id: ConnectionId,
    kind: ConnectionKind,
    remote_addr: SocketAddr,
    opened_at: Instant,
    busy: AtomicUsize,
    requests: AtomicU64,
    close: CancellationToken,
    destroy: CancellationToken,
    /// Woken when the last request guard drops.
    idle: AtomicWaker,
}

/// Control surface of one live connection.
///
/// Cloned into the stream wrapper and into request extensions. Only
/// registry code and the guards it hands out change its state.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("remote_addr", &self.inner.remote_addr)
            .field("idle", &self.is_idle())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.inner.kind
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// No request is currently being processed on this connection.
    pub fn is_idle(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire) == 0
    }

    /// Requests started on this connection so far.
    pub fn request_count(&self) -> u64 {
        self.inner.requests.load(Ordering::Relaxed)
    }

    /// Mark the connection busy until the returned guard drops.
    pub fn begin_request(&self) -> RequestGuard {
        self.inner.busy.fetch_add(1, Ordering::AcqRel);
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        RequestGuard {
            handle: self.clone(),
        }
    }

    pub fn is_close_requested(&self) -> bool {
        self.inner.close.is_cancelled()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroy.is_cancelled()
    }

    /// Ask the connection to end once it is idle.
    pub(crate) fn request_close(&self) {
        self.inner.close.cancel();
    }

    /// Tear the connection down immediately, in-flight request or not.
    pub(crate) fn destroy(&self) {
        self.inner.close.cancel();
        self.inner.destroy.cancel();
    }

    /// Wake `waker` when the connection next becomes idle. Callers re-check
    /// [`is_idle`](Self::is_idle) after registering.
    pub(crate) fn register_idle_waker(&self, waker: &Waker) {
        self.inner.idle.register(waker);
    }

    pub(crate) fn close_requested(&self) -> WaitForCancellationFutureOwned {
        self.inner.close.clone().cancelled_owned()
    }

    pub(crate) fn destroyed(&self) -> WaitForCancellationFutureOwned {
        self.inner.destroy.clone().cancelled_owned()
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.inner.id,
            kind: self.inner.kind,
            remote_addr: self.inner.remote_addr,
            idle: self.is_idle(),
            requests: self.request_count(),
            age: self.inner.opened_at.elapsed(),
        }
    }
}

/// Holds a connection busy. Dropped when the response has been fully sent
/// (or abandoned).
#[derive(Debug)]
pub struct RequestGuard {
    handle: ConnectionHandle,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.handle.inner.busy.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.handle.inner.idle.wake();
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Point-in-time view of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub kind: ConnectionKind,
    pub remote_addr: SocketAddr,
    pub idle: bool,
    pub requests: u64,
    #[serde(with = "duration_millis")]
    pub age: Duration,
}

#[derive(Default)]
struct SubRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
}

impl SubRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionHandle>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct RegistryInner {
    plain: SubRegistry,
    secure: SubRegistry,
    draining: AtomicBool,
}

impl RegistryInner {
    fn sub(&self, kind: ConnectionKind) -> &SubRegistry {
        match kind {
            ConnectionKind::Plain => &self.plain,
            ConnectionKind::Secure => &self.secure,
        }
    }

    fn all_handles(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<_> = self.plain.lock().values().cloned().collect();
        handles.extend(self.secure.lock().values().cloned());
        handles
    }
}

/// Shared registry of live connections. Cheap to clone.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection.
    pub fn open(&self, kind: ConnectionKind, remote_addr: SocketAddr) -> ConnectionGuard {
        let sub = self.inner.sub(kind);
        let id = ConnectionId(sub.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = ConnectionHandle {
            inner: Arc::new(HandleInner {
                id,
                kind,
                remote_addr,
                opened_at: Instant::now(),
                busy: AtomicUsize::new(0),
                requests: AtomicU64::new(0),
                close: CancellationToken::new(),
                destroy: CancellationToken::new(),
                idle: AtomicWaker::new(),
            }),
        };
        sub.lock().insert(id, handle.clone());
        tracing::trace!(kind = %kind, id = %id, remote = %remote_addr, "Connection opened");

        ConnectionGuard {
            registry: self.clone(),
            handle,
        }
    }

    /// No connections of either kind remain.
    pub fn is_empty(&self) -> bool {
        self.inner.plain.lock().is_empty() && self.inner.secure.lock().is_empty()
    }

    pub fn len(&self, kind: ConnectionKind) -> usize {
        self.inner.sub(kind).lock().len()
    }

    pub fn total(&self) -> usize {
        self.len(ConnectionKind::Plain) + self.len(ConnectionKind::Secure)
    }

    pub fn get(&self, kind: ConnectionKind, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.sub(kind).lock().get(&id).cloned()
    }

    /// All live connections, plain first, each kind ordered by id.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut out: Vec<_> = self
            .inner
            .all_handles()
            .iter()
            .map(ConnectionHandle::snapshot)
            .collect();
        out.sort_by_key(|c| (c.kind == ConnectionKind::Secure, c.id));
        out
    }

    /// Request close on every connection idle right now. Returns how many.
    pub fn close_idle(&self) -> usize {
        let mut closed = 0;
        for handle in self.inner.all_handles() {
            if handle.is_idle() {
                handle.request_close();
                closed += 1;
            }
        }
        tracing::debug!(closed, "Requested close on idle connections");
        closed
    }

    /// Forcibly destroy every live connection. Returns how many.
    pub fn destroy_all(&self) -> usize {
        let handles = self.inner.all_handles();
        for handle in &handles {
            handle.destroy();
        }
        handles.len()
    }

    pub fn begin_drain(&self) {
        self.inner.draining.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    fn remove(&self, kind: ConnectionKind, id: ConnectionId) -> bool {
        self.inner.sub(kind).lock().remove(&id).is_some()
    }
}

/// Keeps a connection registered. Dropping it is the connection's close
/// event.
pub struct ConnectionGuard {
    registry: ConnectionRegistry,
    handle: ConnectionHandle,
}

impl ConnectionGuard {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let removed = self.registry.remove(self.handle.kind(), self.handle.id());
        if removed {
            tracing::trace!(
                kind = %self.handle.kind(),
                id = %self.handle.id(),
                requests = self.handle.request_count(),
                "Connection closed"
            );
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn guard_drop_removes_entry_once() {
        let registry = ConnectionRegistry::new();
        let guard = registry.open(ConnectionKind::Plain, addr());
        let id = guard.handle().id();
        assert_eq!(registry.len(ConnectionKind::Plain), 1);
        assert!(registry.get(ConnectionKind::Plain, id).is_some());

        drop(guard);
        assert!(registry.is_empty());
        assert!(registry.get(ConnectionKind::Plain, id).is_none());
    }

    #[test]
    fn ids_are_monotonic_per_kind() {
        let registry = ConnectionRegistry::new();
        let a = registry.open(ConnectionKind::Plain, addr());
        let b = registry.open(ConnectionKind::Plain, addr());
        let s = registry.open(ConnectionKind::Secure, addr());
        assert!(b.handle().id() > a.handle().id());
        assert_eq!(s.handle().id().get(), 0);
        assert_eq!(registry.len(ConnectionKind::Secure), 1);
        assert_eq!(registry.total(), 3);
    }

    #[test]
    fn request_guard_tracks_idle() {
        let registry = ConnectionRegistry::new();
        let guard = registry.open(ConnectionKind::Plain, addr());
        let handle = guard.handle().clone();
        assert!(handle.is_idle());

        let first = handle.begin_request();
        let second = handle.begin_request();
        assert!(!handle.is_idle());
        drop(first);
        assert!(!handle.is_idle());
        drop(second);
        assert!(handle.is_idle());
        assert_eq!(handle.request_count(), 2);
    }

    #[test]
    fn last_request_guard_wakes_idle_waiter() {
        struct Counter(AtomicUsize);

        impl futures::task::ArcWake for Counter {
            fn wake_by_ref(arc_self: &Arc<Self>) {
                arc_self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = ConnectionRegistry::new();
        let guard = registry.open(ConnectionKind::Plain, addr());
        let handle = guard.handle().clone();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let waker = futures::task::waker(Arc::clone(&counter));

        let first = handle.begin_request();
        let second = handle.begin_request();
        handle.register_idle_waker(&waker);
        drop(first);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_idle_skips_busy_connections() {
        let registry = ConnectionRegistry::new();
        let idle = registry.open(ConnectionKind::Plain, addr());
        let busy = registry.open(ConnectionKind::Secure, addr());
        let _request = busy.handle().begin_request();

        assert_eq!(registry.close_idle(), 1);
        assert!(idle.handle().is_close_requested());
        assert!(!busy.handle().is_close_requested());
        assert!(!idle.handle().is_destroyed());
    }

    #[test]
    fn destroy_all_marks_everything() {
        let registry = ConnectionRegistry::new();
        let a = registry.open(ConnectionKind::Plain, addr());
        let b = registry.open(ConnectionKind::Secure, addr());
        assert_eq!(registry.destroy_all(), 2);
        assert!(a.handle().is_destroyed());
        assert!(b.handle().is_destroyed());
        // Destruction does not unregister; the guard drop does.
        assert_eq!(registry.total(), 2);
    }

    #[test]
    fn snapshot_orders_plain_first() {
        let registry = ConnectionRegistry::new();
        let _s = registry.open(ConnectionKind::Secure, addr());
        let _p = registry.open(ConnectionKind::Plain, addr());
        let kinds: Vec<_> = registry.snapshot().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ConnectionKind::Plain, ConnectionKind::Secure]);
    }

    #[test]
    fn draining_flag() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.is_draining());
        registry.begin_drain();
        assert!(registry.is_draining());
        assert!(registry.clone().is_draining());
    }
}
