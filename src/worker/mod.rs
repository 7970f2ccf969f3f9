//! Worker pool: bounded, crash-contained job execution.
//!
//! Core components:
//! - `protocol`: Messages exchanged between the pool and its workers
//! - `job_worker`: A single execution unit running a [`JobHandler`]
//! - `pool`: Fixed-size pool with a global FIFO queue and per-worker slots

pub mod job_worker;
pub mod pool;
pub mod protocol;

pub use job_worker::{JobContext, JobHandler, WorkerInit};
pub use pool::{JobFuture, PoolStats, WorkerPool, WorkerState, WorkerStats};
pub use protocol::{CorrelationId, LogLevel, WorkerExit, WorkerRef};
