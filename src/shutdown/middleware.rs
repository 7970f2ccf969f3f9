//! Request interception: per-request connection bookkeeping and
//! `Connection: close` while draining.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, Version, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body::{Body as HttpBody, Frame, SizeHint};

use crate::net::{ConnectionHandle, RequestGuard};
use crate::shutdown::ShutdownController;

/// Marks the connection busy from request arrival until the response body
/// has been fully written, and asks HTTP/1 clients to disconnect while the
/// process drains.
pub async fn track_request(
    State(controller): State<ShutdownController>,
    request: Request,
    next: Next,
) -> Response {
    let handle = request
        .extensions()
        .get::<ConnectInfo<ConnectionHandle>>()
        .map(|info| info.0.clone());
    let guard = handle.as_ref().map(ConnectionHandle::begin_request);
    let version = request.version();
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let mut response = match &handle {
        Some(handle) => {
            tokio::select! {
                response = next.run(request) => response,
                () = handle.destroyed() => StatusCode::SERVICE_UNAVAILABLE.into_response(),
            }
        }
        None => next.run(request).await,
    };

    if controller.registry().is_draining() {
        tracing::warn!(
            method = %method,
            path = %path,
            connection = handle.as_ref().map(|h| h.id().get()),
            "Request handled while shutting down"
        );
        if matches!(version, Version::HTTP_10 | Version::HTTP_11) {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
    }

    match guard {
        Some(guard) => response.map(|body| {
            Body::new(TrackedBody {
                inner: body,
                _guard: guard,
            })
        }),
        None => response,
    }
}

/// Response body that releases its request guard when dropped.
struct TrackedBody {
    inner: Body,
    _guard: RequestGuard,
}

impl HttpBody for TrackedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
