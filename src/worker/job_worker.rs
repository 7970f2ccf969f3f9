//! JobWorker: a single isolated execution unit.
//!
//! A worker owns its handler instance and talks to the pool only through
//! [`WorkerCommand`] / [`WorkerEvent`] messages. It runs up to the pool's
//! per-worker limit of jobs concurrently inside its own task and answers
//! every dispatched job with exactly one terminal event.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;

use crate::error::JobFailure;
use crate::worker::protocol::{
    CorrelationId, Envelope, LogLevel, WorkerCommand, WorkerEvent, WorkerExit, WorkerRef,
};

/// The work function run inside a worker.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Job: Send + 'static;
    type Output: Send + 'static;

    /// Run one job. Errors and panics are both reported back to the
    /// submitter; neither takes the worker down.
    async fn run(&self, job: Self::Job, ctx: &JobContext) -> Result<Self::Output, JobFailure>;
}

/// Everything an entry point receives when a worker (re)spawns.
#[derive(Debug)]
pub struct WorkerInit<S> {
    pub worker: WorkerRef,
    /// Read-only data shared by every worker in the pool.
    pub shared: Arc<S>,
}

/// Per-job view handed to [`JobHandler::run`].
#[derive(Debug, Clone)]
pub struct JobContext {
    worker: WorkerRef,
    correlation_id: CorrelationId,
    logs: mpsc::UnboundedSender<LogLine>,
}

#[derive(Debug)]
struct LogLine {
    correlation_id: Option<CorrelationId>,
    level: LogLevel,
    message: String,
}

impl JobContext {
    pub fn worker(&self) -> WorkerRef {
        self.worker
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Relay a log line to the coordinator, which logs it on the worker's behalf.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.logs.send(LogLine {
            correlation_id: Some(self.correlation_id),
            level,
            message: message.into(),
        });
    }
}

pub(crate) type EventSender<R> = mpsc::UnboundedSender<Envelope<R>>;

/// Worker task state. Consumed by [`JobWorker::run`].
pub(crate) struct JobWorker<H: JobHandler> {
    worker: WorkerRef,
    handler: Arc<H>,
    commands: mpsc::UnboundedReceiver<WorkerCommand<H::Job>>,
    events: EventSender<H::Output>,
}

impl<H: JobHandler> JobWorker<H> {
    pub(crate) fn new(
        worker: WorkerRef,
        handler: H,
        commands: mpsc::UnboundedReceiver<WorkerCommand<H::Job>>,
        events: EventSender<H::Output>,
    ) -> Self {
        Self {
            worker,
            handler: Arc::new(handler),
            commands,
            events,
        }
    }

    fn emit(&self, event: WorkerEvent<H::Output>) {
        // The coordinator may already be gone during teardown.
        let _ = self.events.send(Envelope::Event(self.worker, event));
    }

    /// Run until stopped. Returns [`WorkerExit::Clean`] after draining
    /// in-flight jobs.
    pub(crate) async fn run(mut self) -> WorkerExit {
        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LogLine>();
        let mut running = FuturesUnordered::new();
        let mut stopping = false;

        tracing::debug!(worker = %self.worker, "Worker online");
        self.emit(WorkerEvent::Online);

        loop {
            tokio::select! {
                biased;

                Some(line) = log_rx.recv() => {
                    self.emit(WorkerEvent::Log {
                        correlation_id: line.correlation_id,
                        level: line.level,
                        message: line.message,
                    });
                }

                Some((correlation_id, outcome)) = running.next(), if !running.is_empty() => {
                    self.flush_logs(&mut log_rx);
                    let event = match outcome {
                        Ok(output) => WorkerEvent::Result { correlation_id, output },
                        Err(error) => WorkerEvent::Error { correlation_id, error },
                    };
                    self.emit(event);
                }

                command = self.commands.recv(), if !stopping => match command {
                    Some(WorkerCommand::Start { correlation_id, data }) => {
                        let ctx = JobContext {
                            worker: self.worker,
                            correlation_id,
                            logs: log_tx.clone(),
                        };
                        running.push(run_job(Arc::clone(&self.handler), data, ctx));
                    }
                    Some(WorkerCommand::Stop) | None => {
                        tracing::debug!(
                            worker = %self.worker,
                            in_flight = running.len(),
                            "Worker stopping"
                        );
                        stopping = true;
                    }
                },
            }

            if stopping && running.is_empty() {
                break;
            }
        }

        self.flush_logs(&mut log_rx);
        tracing::debug!(worker = %self.worker, "Worker stopped");
        WorkerExit::Clean
    }

    /// Forward log lines already queued by jobs of this worker.
    fn flush_logs(&self, log_rx: &mut mpsc::UnboundedReceiver<LogLine>) {
        while let Ok(line) = log_rx.try_recv() {
            self.emit(WorkerEvent::Log {
                correlation_id: line.correlation_id,
                level: line.level,
                message: line.message,
            });
        }
    }
}

async fn run_job<H: JobHandler>(
    handler: Arc<H>,
    data: H::Job,
    ctx: JobContext,
) -> (CorrelationId, Result<H::Output, JobFailure>) {
    let correlation_id = ctx.correlation_id;
    let outcome = AssertUnwindSafe(handler.run(data, &ctx)).catch_unwind().await;
    let result = match outcome {
        Ok(result) => result,
        Err(panic) => Err(JobFailure::Panicked(panic_message(panic.as_ref()))),
    };
    (correlation_id, result)
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
