//! Graceful shutdown: drain live connections within a bounded time, then
//! close the listeners.
//!
//! The [`ShutdownController`] owns the listeners it binds and the
//! [`ConnectionRegistry`] they feed. A shutdown moves the controller through
//! `Running → Draining → Closed`; the first caller starts the drain and
//! every caller waits for `Closed`.

pub mod middleware;
pub mod signals;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::Router;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::ShutdownConfig;
use crate::error::ShutdownError;
use crate::net::{ConnectionHandle, ConnectionKind, ConnectionRegistry, GatewayListener, StreamTimeouts};

/// Where the process is in its shutdown lifecycle. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Running,
    Draining,
    Closed,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Async hook run once, before draining starts.
pub type PreShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Inner {
    config: ShutdownConfig,
    timeouts: StreamTimeouts,
    registry: ConnectionRegistry,
    state: watch::Sender<ShutdownState>,
    /// Tells every axum server to stop accepting.
    stop_accepting: CancellationToken,
    /// Bound but not yet handed to axum.
    unserved: Mutex<Vec<GatewayListener>>,
    /// One per bound listener; cancelled when that listener is dropped.
    listener_closed: Mutex<Vec<(ConnectionKind, SocketAddr, CancellationToken)>>,
    pre_shutdown: Mutex<Option<PreShutdownHook>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coordinates the shutdown of every listener and connection in the process.
#[derive(Clone)]
pub struct ShutdownController {
    inner: Arc<Inner>,
}

impl ShutdownController {
    pub fn new(config: ShutdownConfig, timeouts: StreamTimeouts, registry: ConnectionRegistry) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            inner: Arc::new(Inner {
                config,
                timeouts,
                registry,
                state,
                stop_accepting: CancellationToken::new(),
                unserved: Mutex::new(Vec::new()),
                listener_closed: Mutex::new(Vec::new()),
                pre_shutdown: Mutex::new(None),
            }),
        }
    }

    /// Run `hook` once at the start of the drain, before the registry is
    /// marked draining.
    pub fn with_pre_shutdown<F, Fut>(self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *lock(&self.inner.pre_shutdown) = Some(Box::new(move || Box::pin(hook())));
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn state(&self) -> ShutdownState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.inner.state.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// Bind a listener. Connections on it are secure iff `tls` is set.
    /// Returns the bound address.
    pub async fn bind(&self, addr: SocketAddr, tls: Option<TlsAcceptor>) -> std::io::Result<SocketAddr> {
        let tcp = TcpListener::bind(addr).await?;
        let local = tcp.local_addr()?;
        let closed = CancellationToken::new();
        let listener = GatewayListener::new(
            tcp,
            tls,
            self.inner.registry.clone(),
            self.inner.timeouts,
            closed.clone().drop_guard(),
        );
        let kind = listener.kind();
        tracing::info!(kind = %kind, addr = %local, "Listening");

        lock(&self.inner.listener_closed).push((kind, local, closed));
        lock(&self.inner.unserved).push(listener);
        Ok(local)
    }

    /// Serve `router` on every bound listener. Returns once shutdown has
    /// closed the listeners.
    pub async fn serve(&self, router: Router) {
        let listeners: Vec<_> = lock(&self.inner.unserved).drain(..).collect();
        if listeners.is_empty() {
            tracing::warn!("serve called with no bound listeners");
        }

        let app = router.layer(axum::middleware::from_fn_with_state(
            self.clone(),
            middleware::track_request,
        ));
        for listener in listeners {
            let kind = listener.kind();
            let make_service = app
                .clone()
                .into_make_service_with_connect_info::<ConnectionHandle>();
            let signal = self.inner.stop_accepting.clone().cancelled_owned();
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, make_service)
                    .with_graceful_shutdown(signal)
                    .await
                {
                    tracing::error!(kind = %kind, error = %e, "Server error");
                }
            });
        }

        self.closed().await;
    }

    /// Resolve once shutdown has completed.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ShutdownState::Closed).await;
    }

    /// Start shutting down unless already started. Returns `true` for the
    /// call that started it.
    pub fn trigger(&self, reason: &str) -> bool {
        let mut started = false;
        self.inner.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                started = true;
                true
            } else {
                false
            }
        });

        if started {
            tracing::info!(
                reason,
                connections = self.inner.registry.total(),
                timeout_ms = self.inner.config.timeout.as_millis() as u64,
                "Shutdown started"
            );
            tokio::spawn(self.clone().drain());
        } else {
            tracing::debug!(reason, state = %self.state(), "Shutdown already in progress");
        }
        started
    }

    /// Shut down and wait until the listeners are closed. Idempotent:
    /// concurrent and repeated calls all resolve at the same moment.
    pub async fn shutdown(&self, reason: &str) {
        self.trigger(reason);
        self.closed().await;
    }

    async fn drain(self) {
        let started = Instant::now();
        let registry = &self.inner.registry;
        let config = &self.inner.config;

        let hook = lock(&self.inner.pre_shutdown).take();
        if let Some(hook) = hook {
            hook().await;
        }
        registry.begin_drain();

        let max_polls = config.max_polls();
        let mut polls = 0;
        let drained = loop {
            if registry.is_empty() {
                break true;
            }
            if polls >= max_polls {
                break false;
            }
            // Connections that went idle since the last poll.
            registry.close_idle();
            tokio::time::sleep(config.poll_interval).await;
            polls += 1;
        };

        if drained {
            tracing::info!(
                polls,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "All connections drained"
            );
        } else {
            tracing::warn!(
                plain = registry.len(ConnectionKind::Plain),
                secure = registry.len(ConnectionKind::Secure),
                timeout_ms = config.timeout.as_millis() as u64,
                "Shutdown timeout reached with connections still open"
            );
            if config.force_close_on_timeout {
                let destroyed = registry.destroy_all();
                tracing::warn!(destroyed, "Force-closed remaining connections");
            }
        }

        if let Err(e) = self.close_listeners().await {
            tracing::error!(error = %e, "Error closing listeners");
        }

        self.inner.state.send_replace(ShutdownState::Closed);
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Shutdown complete"
        );
    }

    async fn close_listeners(&self) -> Result<(), ShutdownError> {
        self.inner.stop_accepting.cancel();
        // Listeners never handed to axum close right here.
        lock(&self.inner.unserved).clear();

        let limit = self.inner.config.listener_close_timeout;
        let waits: Vec<_> = lock(&self.inner.listener_closed)
            .iter()
            .map(|(kind, addr, closed)| {
                let (kind, addr, closed) = (*kind, *addr, closed.clone());
                async move {
                    let result = tokio::time::timeout(limit, closed.cancelled()).await;
                    if result.is_ok() {
                        tracing::debug!(kind = %kind, addr = %addr, "Listener closed");
                    }
                    result
                }
            })
            .collect();

        let results = join_all(waits).await;
        if results.iter().any(Result::is_err) {
            return Err(ShutdownError::ListenerCloseTimeout(limit));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn controller(timeout_ms: u64, force: bool) -> ShutdownController {
        let config = ShutdownConfig {
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(10),
            force_close_on_timeout: force,
            listener_close_timeout: Duration::from_millis(200),
        };
        let timeouts = StreamTimeouts {
            keep_alive: Duration::from_secs(60),
            headers: Duration::from_secs(60),
        };
        ShutdownController::new(config, timeouts, ConnectionRegistry::new())
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn shutdown_with_no_connections_closes_promptly() {
        let ctl = controller(1_000, false);
        let started = std::time::Instant::now();
        timeout(TEST_TIMEOUT, ctl.shutdown("test")).await.unwrap();
        assert_eq!(ctl.state(), ShutdownState::Closed);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn repeated_and_concurrent_calls_share_one_drain() {
        let ctl = controller(50, false);
        assert!(ctl.trigger("first"));
        assert!(!ctl.trigger("second"));

        let a = ctl.shutdown("third");
        let b = ctl.shutdown("fourth");
        timeout(TEST_TIMEOUT, async { tokio::join!(a, b) }).await.unwrap();
        assert_eq!(ctl.state(), ShutdownState::Closed);
        assert!(!ctl.trigger("after close"));
    }

    #[tokio::test]
    async fn pre_shutdown_hook_runs_before_drain() {
        let seen = Arc::new(Mutex::new(None));
        let seen_in_hook = Arc::clone(&seen);
        let ctl = controller(50, false);
        let registry = ctl.registry().clone();
        let ctl = ctl.with_pre_shutdown(move || async move {
            *seen_in_hook.lock().unwrap() = Some(registry.is_draining());
        });

        timeout(TEST_TIMEOUT, ctl.shutdown("test")).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(false));
        assert!(ctl.registry().is_draining());
    }

    #[tokio::test]
    async fn open_connection_holds_drain_until_timeout() {
        let ctl = controller(100, false);
        let addr = localhost();
        let registry = ctl.registry().clone();
        let held = registry.open(ConnectionKind::Plain, addr);

        let started = std::time::Instant::now();
        timeout(TEST_TIMEOUT, ctl.shutdown("test")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(ctl.state(), ShutdownState::Closed);
        // Without force close the connection is left alone.
        assert!(!held.handle().is_destroyed());
    }

    #[tokio::test]
    async fn force_close_destroys_stragglers() {
        let ctl = controller(30, true);
        let held = ctl.registry().open(ConnectionKind::Secure, localhost());
        timeout(TEST_TIMEOUT, ctl.shutdown("test")).await.unwrap();
        assert!(held.handle().is_destroyed());
    }

    #[tokio::test]
    async fn bound_listener_stops_accepting_after_shutdown() {
        let ctl = controller(50, false);
        let addr = ctl.bind(localhost(), None).await.unwrap();
        let server = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.serve(Router::new()).await }
        });

        TcpStream::connect(addr).await.unwrap();
        timeout(TEST_TIMEOUT, ctl.shutdown("test")).await.unwrap();
        timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn unserved_listener_is_closed_on_shutdown() {
        let ctl = controller(10, false);
        let addr = ctl.bind(localhost(), None).await.unwrap();
        timeout(TEST_TIMEOUT, ctl.shutdown("test")).await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
