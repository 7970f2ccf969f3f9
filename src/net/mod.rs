//! Listener plumbing: connection tracking, lifecycle-aware streams, TLS.

pub mod listener;
pub mod registry;
pub mod stream;
pub mod tls;

pub use listener::GatewayListener;
pub use registry::{
    ConnectionGuard, ConnectionHandle, ConnectionId, ConnectionKind, ConnectionRegistry,
    ConnectionSnapshot, RequestGuard,
};
pub use stream::{StreamTimeouts, TrackedStream};
