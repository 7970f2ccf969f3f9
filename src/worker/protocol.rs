//! Message envelope exchanged between the pool coordinator and its workers.
//!
//! Every message crossing the worker boundary is one of these closed enums.
//! Results are matched to their job by an explicit [`CorrelationId`], never
//! by position, so completions may arrive in any order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::JobFailure;

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide job identifier assigned at dispatch time. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Allocate the next id.
    pub fn next() -> Self {
        Self(NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One incarnation of a worker slot.
///
/// `generation` is bumped on every respawn so messages from a dead
/// incarnation can be told apart from its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerRef {
    pub index: usize,
    pub generation: u64,
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Coordinator → worker.
#[derive(Debug)]
pub enum WorkerCommand<J> {
    /// Start a job.
    Start { correlation_id: CorrelationId, data: J },
    /// Finish in-flight jobs and exit cleanly.
    Stop,
}

/// Severity of a relayed log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Worker → coordinator.
#[derive(Debug)]
pub enum WorkerEvent<R> {
    /// The worker finished initialising and can take jobs.
    Online,
    /// Informational log relay.
    Log {
        correlation_id: Option<CorrelationId>,
        level: LogLevel,
        message: String,
    },
    /// A job completed.
    Result {
        correlation_id: CorrelationId,
        output: R,
    },
    /// A job failed.
    Error {
        correlation_id: CorrelationId,
        error: JobFailure,
    },
}

impl<R> WorkerEvent<R> {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Log { .. } => "log",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
        }
    }
}

/// What the coordinator receives on its signal channel.
///
/// Exits travel on the same channel as events, so a worker's last events
/// are always observed before its exit.
#[derive(Debug)]
pub(crate) enum Envelope<R> {
    Event(WorkerRef, WorkerEvent<R>),
    Exit(WorkerRef, WorkerExit),
}

/// How a worker task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped on request (exit code 0).
    Clean,
    /// Panicked outside of job logic.
    Crashed(String),
    /// Killed from outside.
    Aborted,
}

impl WorkerExit {
    /// Process-style exit code: 0 for a clean stop, 1 otherwise.
    pub fn code(&self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::Crashed(_) | Self::Aborted => 1,
        }
    }
}
