//! Content gateway: prefetching worker pool behind a gracefully draining
//! HTTP server.

pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod net;
pub mod prefetch;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod webhook;
pub mod worker;
