//! Error types for the gateway.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// Failure raised by job logic inside a worker.
///
/// Delivered to the submitter as a rejection; never takes the worker down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    #[error("{0}")]
    Failed(String),

    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A worker terminated unexpectedly or broke the message protocol.
///
/// Every job held by that worker at the time is rejected with this error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerFault {
    #[error("worker {index} crashed: {reason}")]
    Crashed { index: usize, reason: String },

    #[error("worker {index} was terminated")]
    Terminated { index: usize },

    #[error("worker {index} violated the message protocol: {detail}")]
    ProtocolViolation { index: usize, detail: String },

    #[error("worker {index} exited with jobs outstanding")]
    Exited { index: usize },
}

impl WorkerFault {
    /// Pool index of the worker that failed.
    pub fn index(&self) -> usize {
        match self {
            Self::Crashed { index, .. }
            | Self::Terminated { index }
            | Self::ProtocolViolation { index, .. }
            | Self::Exited { index } => *index,
        }
    }
}

/// Errors surfaced to callers of `WorkerPool::submit`.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("job failed: {0}")]
    Job(#[from] JobFailure),

    #[error("{0}")]
    WorkerFault(#[from] WorkerFault),

    #[error("worker pool is closed")]
    Closed,
}

/// Errors raised while closing the listeners. Logged and swallowed.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("listener did not close within {0:?}")]
    ListenerCloseTimeout(Duration),

    #[error("listener task failed: {0}")]
    ListenerTask(String),
}

/// Failure to install a periodic background task. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum SchedulingSetupError {
    #[error("invalid schedule for {name}: {reason}")]
    InvalidSchedule { name: String, reason: String },

    #[error("schedule for {name} never fires")]
    NeverFires { name: String },
}

/// Keyed byte-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Query failed: {0}")]
    Query(String),
}

/// Content fetch errors.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request for {id} failed: {reason}")]
    Request { id: String, reason: String },

    #[error("upstream returned {status} for {id}")]
    Status { id: String, status: u16 },

    #[error("stream for {id} broke: {reason}")]
    Stream { id: String, reason: String },
}

/// Outbound notification errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("endpoint returned status {0}")]
    Status(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_fault_reports_index() {
        let fault = WorkerFault::ProtocolViolation {
            index: 3,
            detail: "unknown correlation id 9".into(),
        };
        assert_eq!(fault.index(), 3);
        assert!(fault.to_string().contains("unknown correlation id 9"));
    }

    #[test]
    fn pool_error_wraps_job_failure() {
        let err: PoolError = JobFailure::new("hash mismatch").into();
        assert_eq!(err.to_string(), "job failed: hash mismatch");
    }
}
