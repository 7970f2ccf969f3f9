//! TrackedStream: transport wrapper that enforces connection lifecycle.
//!
//! The wrapper sees every read the HTTP server makes, which is enough to
//! tell apart the three phases of a keep-alive connection:
//!
//! * waiting: idle between requests, keep-alive timer running
//! * receiving: request bytes arrived but no handler has picked it up yet,
//!   headers timer running
//! * busy: at least one request guard is alive
//!
//! A close request turns the next idle read into EOF, so the server ends the
//! connection without cutting a response short. Destruction fails every
//! read and write immediately.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tokio_rustls::server::TlsStream;
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::net::registry::{ConnectionGuard, ConnectionHandle};

/// Idle timers applied to every accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct StreamTimeouts {
    pub keep_alive: Duration,
    pub headers: Duration,
}

/// Underlying byte transport.
pub(crate) enum Transport {
    Plain(TcpStream),
    /// TLS handshake in progress; completed on first use.
    Handshaking(Pin<Box<tokio_rustls::Accept<TcpStream>>>),
    Tls(Box<TlsStream<TcpStream>>),
    /// Handshake failed; every further operation errors.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Receiving,
    Busy,
}

pub struct TrackedStream {
    transport: Transport,
    guard: ConnectionGuard,
    timeouts: StreamTimeouts,
    phase: Phase,
    timer: Pin<Box<Sleep>>,
    close: Pin<Box<WaitForCancellationFutureOwned>>,
    destroy: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl TrackedStream {
    pub(crate) fn new(transport: Transport, guard: ConnectionGuard, timeouts: StreamTimeouts) -> Self {
        let handle = guard.handle();
        let close = Box::pin(handle.close_requested());
        let destroy = Box::pin(handle.destroyed());
        Self {
            transport,
            guard,
            timeouts,
            phase: Phase::Waiting,
            timer: Box::pin(tokio::time::sleep(timeouts.keep_alive)),
            close,
            destroy,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        self.guard.handle()
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        self.phase = phase;
        let timeout = match phase {
            Phase::Waiting => self.timeouts.keep_alive,
            Phase::Receiving => self.timeouts.headers,
            Phase::Busy => return,
        };
        self.timer.as_mut().reset(Instant::now() + timeout);
    }

    /// Ready(Err) once the connection has been destroyed. Registers the
    /// waker otherwise.
    fn poll_destroyed(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        match self.destroy.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection destroyed",
            )),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Drive a pending TLS handshake. Ready(Ok) once the transport is usable.
    fn poll_transport_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Transport::Handshaking(accept) = &mut self.transport else {
            return match self.transport {
                Transport::Failed => Poll::Ready(Err(handshake_failed())),
                _ => Poll::Ready(Ok(())),
            };
        };
        match accept.as_mut().poll(cx) {
            Poll::Ready(Ok(stream)) => {
                tracing::trace!(id = %self.guard.handle().id(), "TLS handshake complete");
                self.transport = Transport::Tls(Box::new(stream));
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                tracing::debug!(
                    id = %self.guard.handle().id(),
                    remote = %self.guard.handle().remote_addr(),
                    error = %e,
                    "TLS handshake failed"
                );
                self.transport = Transport::Failed;
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_read_transport(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Poll::Ready(Err(e)) = self.poll_transport_ready(cx) {
            return Poll::Ready(Err(e));
        }
        match &mut self.transport {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::Handshaking(_) => Poll::Pending,
            Transport::Failed => Poll::Ready(Err(handshake_failed())),
        }
    }
}

fn handshake_failed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "TLS handshake failed")
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.poll_destroyed(cx) {
            return Poll::Ready(Err(e));
        }

        if !this.guard.handle().is_idle() {
            this.enter(Phase::Busy);
            this.guard.handle().register_idle_waker(cx.waker());
            // The last guard may have dropped between the check and the
            // registration.
            if !this.guard.handle().is_idle() {
                return this.poll_read_transport(cx, buf);
            }
        }
        if this.phase == Phase::Busy {
            this.enter(Phase::Waiting);
        }

        let before = buf.filled().len();
        match this.poll_read_transport(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.enter(Phase::Receiving);
                }
                return Poll::Ready(Ok(()));
            }
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => {}
        }

        if this.phase == Phase::Waiting && this.close.as_mut().poll(cx).is_ready() {
            // Reported as EOF: the server finishes the connection cleanly.
            return Poll::Ready(Ok(()));
        }

        if this.timer.as_mut().poll(cx).is_ready() {
            return match this.phase {
                Phase::Waiting => {
                    tracing::trace!(id = %this.guard.handle().id(), "Keep-alive timeout");
                    Poll::Ready(Ok(()))
                }
                _ => {
                    tracing::debug!(
                        id = %this.guard.handle().id(),
                        remote = %this.guard.handle().remote_addr(),
                        "Headers timeout"
                    );
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "request headers not received in time",
                    )))
                }
            };
        }

        Poll::Pending
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.poll_destroyed(cx) {
            return Poll::Ready(Err(e));
        }
        match this.poll_transport_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        match &mut this.transport {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::Handshaking(_) => Poll::Pending,
            Transport::Failed => Poll::Ready(Err(handshake_failed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.transport {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::Handshaking(_) | Transport::Failed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.transport {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::Handshaking(_) | Transport::Failed => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;
    use crate::net::registry::{ConnectionKind, ConnectionRegistry};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn pair(registry: &ConnectionRegistry, timeouts: StreamTimeouts) -> (TrackedStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, remote) = listener.accept().await.unwrap();
        let guard = registry.open(ConnectionKind::Plain, remote);
        (TrackedStream::new(Transport::Plain(server), guard, timeouts), client)
    }

    fn long() -> StreamTimeouts {
        StreamTimeouts {
            keep_alive: Duration::from_secs(60),
            headers: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn passes_bytes_through() {
        let registry = ConnectionRegistry::new();
        let (mut server, mut client) = pair(&registry, long()).await;
        client.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        timeout(TEST_TIMEOUT, server.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        timeout(TEST_TIMEOUT, client.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn close_request_on_idle_reads_as_eof() {
        let registry = ConnectionRegistry::new();
        let (mut server, _client) = pair(&registry, long()).await;
        let handle = server.handle().clone();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            server.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.close_idle();

        let n = timeout(TEST_TIMEOUT, reader).await.unwrap().unwrap().unwrap();
        assert_eq!(n, 0);
        assert!(handle.is_close_requested());
    }

    #[tokio::test]
    async fn busy_connection_ignores_close_request() {
        let registry = ConnectionRegistry::new();
        let (mut server, _client) = pair(&registry, long()).await;
        let _request = server.handle().begin_request();
        server.handle().request_close();

        let mut buf = [0u8; 8];
        let read = timeout(Duration::from_millis(50), server.read(&mut buf)).await;
        assert!(read.is_err(), "busy read should stay pending");
    }

    #[tokio::test]
    async fn close_request_after_request_finishes_reads_as_eof() {
        let registry = ConnectionRegistry::new();
        let (mut server, _client) = pair(&registry, long()).await;
        let request = server.handle().begin_request();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            server.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(request);
        registry.close_idle();

        let n = timeout(TEST_TIMEOUT, reader).await.unwrap().unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn keep_alive_timer_restarts_after_request_finishes() {
        let registry = ConnectionRegistry::new();
        let timeouts = StreamTimeouts {
            keep_alive: Duration::from_millis(200),
            headers: Duration::from_secs(60),
        };
        let (mut server, _client) = pair(&registry, timeouts).await;
        let request = server.handle().begin_request();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            server.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(request);

        let n = timeout(TEST_TIMEOUT, reader).await.unwrap().unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn destroy_fails_pending_read() {
        let registry = ConnectionRegistry::new();
        let (mut server, _client) = pair(&registry, long()).await;
        let _request = server.handle().begin_request();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            server.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.destroy_all();

        let err = timeout(TEST_TIMEOUT, reader).await.unwrap().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        // The reader task dropped the stream, and with it the registration.
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn keep_alive_timeout_ends_idle_connection() {
        let registry = ConnectionRegistry::new();
        let timeouts = StreamTimeouts {
            keep_alive: Duration::from_millis(30),
            headers: Duration::from_secs(60),
        };
        let (mut server, _client) = pair(&registry, timeouts).await;
        let mut buf = [0u8; 8];
        let n = timeout(TEST_TIMEOUT, server.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn headers_timeout_errors_partial_request() {
        let registry = ConnectionRegistry::new();
        let timeouts = StreamTimeouts {
            keep_alive: Duration::from_secs(60),
            headers: Duration::from_millis(30),
        };
        let (mut server, mut client) = pair(&registry, timeouts).await;
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(TEST_TIMEOUT, server.read(&mut buf)).await.unwrap().unwrap();
        assert!(n > 0);
        let err = timeout(TEST_TIMEOUT, server.read(&mut buf)).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
