//! GatewayListener: an `axum::serve::Listener` that registers every
//! accepted connection with the [`ConnectionRegistry`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::DropGuard;

use crate::net::registry::{ConnectionHandle, ConnectionKind, ConnectionRegistry};
use crate::net::stream::{StreamTimeouts, TrackedStream, Transport};

pub struct GatewayListener {
    tcp: TcpListener,
    kind: ConnectionKind,
    tls: Option<TlsAcceptor>,
    registry: ConnectionRegistry,
    timeouts: StreamTimeouts,
    /// Cancels the listener's "closed" token when axum drops the listener.
    _closed: DropGuard,
}

impl GatewayListener {
    /// Wrap a bound TCP listener. Connections are secure iff `tls` is set.
    pub fn new(
        tcp: TcpListener,
        tls: Option<TlsAcceptor>,
        registry: ConnectionRegistry,
        timeouts: StreamTimeouts,
        closed: DropGuard,
    ) -> Self {
        let kind = if tls.is_some() {
            ConnectionKind::Secure
        } else {
            ConnectionKind::Plain
        };
        Self {
            tcp,
            kind,
            tls,
            registry,
            timeouts,
            _closed: closed,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }
}

impl Listener for GatewayListener {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.tcp.accept().await {
                Ok((stream, remote)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::trace!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    let guard = self.registry.open(self.kind, remote);
                    // The handshake runs on the connection's own task.
                    let transport = match &self.tls {
                        Some(acceptor) => Transport::Handshaking(Box::pin(acceptor.accept(stream))),
                        None => Transport::Plain(stream),
                    };
                    return (TrackedStream::new(transport, guard, self.timeouts), remote);
                }
                Err(e) if is_connection_error(&e) => {
                    tracing::trace!(error = %e, "Connection error during accept");
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    tracing::error!(kind = %self.kind, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.tcp.local_addr()
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

impl Connected<IncomingStream<'_, GatewayListener>> for ConnectionHandle {
    fn connect_info(stream: IncomingStream<'_, GatewayListener>) -> Self {
        stream.io().handle().clone()
    }
}
