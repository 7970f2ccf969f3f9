//! WorkerPool: a fixed set of JobWorkers fed from one global FIFO queue.
//!
//! The pool is a handle onto a single coordinator task that owns the queue
//! and every worker's slot map. All mutation happens inside that task, so
//! no locks guard the queue; callers talk to it over a channel.
//!
//! Dispatch walks workers in index order and fills each `Online` worker up
//! to `tasks_per_worker`. Each dispatched job gets a fresh
//! [`CorrelationId`] and lives in the owning worker's slot map until a
//! terminal event arrives or the worker dies, in which case every job in
//! that map is rejected and the worker is respawned in the same position.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use crate::config::PoolConfig;
use crate::error::{PoolError, WorkerFault};
use crate::worker::job_worker::{EventSender, JobHandler, JobWorker, WorkerInit, panic_message};
use crate::worker::protocol::{
    CorrelationId, Envelope, LogLevel, WorkerCommand, WorkerEvent, WorkerExit, WorkerRef,
};

type Reply<R> = oneshot::Sender<Result<R, PoolError>>;
type HandlerFactory<H> = Arc<dyn Fn(WorkerRef) -> H + Send + Sync>;

/// Lifecycle of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, waiting for its `Online` event.
    Spawning,
    /// Accepting jobs.
    Online,
    /// Faulted; waiting for the task to exit before respawning.
    Crashed,
    /// Asked to stop during pool shutdown.
    Stopping,
    /// Exited for good.
    Terminated,
}

/// Snapshot of one worker slot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub index: usize,
    pub generation: u64,
    pub state: WorkerState,
    pub in_flight: usize,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pending: usize,
    pub workers: Vec<WorkerStats>,
}

impl PoolStats {
    pub fn online(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Online)
            .count()
    }

    pub fn in_flight(&self) -> usize {
        self.workers.iter().map(|w| w.in_flight).sum()
    }
}

/// Completion handle returned by [`WorkerPool::submit`].
///
/// The job is already queued when this is returned; awaiting it is the
/// only suspension point.
#[must_use = "the job runs regardless, but its result is lost unless awaited"]
pub struct JobFuture<R> {
    rx: oneshot::Receiver<Result<R, PoolError>>,
}

impl<R> Future for JobFuture<R> {
    type Output = Result<R, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(PoolError::Closed)))
    }
}

struct QueuedJob<J, R> {
    data: J,
    reply: Reply<R>,
    queued_at: Instant,
}

enum Request<H: JobHandler> {
    Submit(QueuedJob<H::Job, H::Output>),
    Stats(oneshot::Sender<PoolStats>),
    Terminate {
        index: usize,
        done: oneshot::Sender<bool>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Handle onto a running pool. Cheap to clone; the pool shuts down once
/// every handle is dropped.
pub struct WorkerPool<H: JobHandler> {
    requests: mpsc::UnboundedSender<Request<H>>,
    pending: Arc<AtomicUsize>,
    online: watch::Receiver<usize>,
    worker_count: usize,
}

impl<H: JobHandler> Clone for WorkerPool<H> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            pending: Arc::clone(&self.pending),
            online: self.online.clone(),
            worker_count: self.worker_count,
        }
    }
}

impl<H: JobHandler> WorkerPool<H> {
    /// Spawn `config.worker_count` workers. Each comes online asynchronously.
    ///
    /// `entry` is called inside every new worker task (including respawns)
    /// to build that worker's private handler from the shared init data.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<S, E>(config: PoolConfig, entry: E, shared: S) -> Self
    where
        S: Send + Sync + 'static,
        E: Fn(WorkerInit<S>) -> H + Send + Sync + 'static,
    {
        let shared = Arc::new(shared);
        let factory: HandlerFactory<H> = Arc::new(move |worker| {
            entry(WorkerInit {
                worker,
                shared: Arc::clone(&shared),
            })
        });

        let worker_count = config.worker_count.max(1);
        let tasks_per_worker = config.tasks_per_worker.max(1);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (online_tx, online_rx) = watch::channel(0);
        let pending = Arc::new(AtomicUsize::new(0));

        let mut coordinator = Coordinator {
            config: PoolConfig {
                worker_count,
                tasks_per_worker,
                ..config
            },
            factory,
            queue: VecDeque::new(),
            slots: Vec::with_capacity(worker_count),
            signals: signals_tx,
            pending: Arc::clone(&pending),
            online: online_tx,
            closing: false,
            shutdown_waiters: Vec::new(),
        };
        for index in 0..worker_count {
            let slot = coordinator.spawn_worker(WorkerRef {
                index,
                generation: 0,
            });
            coordinator.slots.push(slot);
        }

        tracing::info!(
            workers = worker_count,
            tasks_per_worker = coordinator.config.tasks_per_worker,
            "Worker pool started"
        );
        tokio::spawn(coordinator.run(requests_rx, signals_rx));

        Self {
            requests: requests_tx,
            pending,
            online: online_rx,
            worker_count,
        }
    }

    /// Queue a job at the tail of the global FIFO. Never blocks.
    pub fn submit(&self, data: H::Job) -> JobFuture<H::Output> {
        let (reply, rx) = oneshot::channel();
        let job = QueuedJob {
            data,
            reply,
            queued_at: Instant::now(),
        };
        // Counted before the send so the coordinator never decrements first.
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.requests.send(Request::Submit(job)).is_err() {
            // The reply sender was dropped with the request, so the future
            // resolves to `PoolError::Closed`.
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        JobFuture { rx }
    }

    /// Jobs queued but not yet dispatched to any worker.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Configured number of workers; constant for the life of the pool.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Current snapshot, or `Closed` once the coordinator has exited.
    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Stats(tx))
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Resolve once every worker slot is online.
    pub async fn wait_online(&self) {
        let mut online = self.online.clone();
        let target = self.worker_count;
        let _ = online.wait_for(|n| *n >= target).await;
    }

    /// Forcibly kill the worker at `index`. Its outstanding jobs are
    /// rejected and a replacement is spawned. Returns `false` for an
    /// unknown or already terminated slot.
    pub async fn terminate_worker(&self, index: usize) -> bool {
        let (done, rx) = oneshot::channel();
        if self
            .requests
            .send(Request::Terminate { index, done })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Reject queued jobs, stop every worker after its in-flight jobs finish
    /// (bounded by `shutdown_timeout`), then stop the coordinator.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct InFlight<R> {
    reply: Reply<R>,
    dispatched_at: Instant,
}

struct WorkerSlot<H: JobHandler> {
    worker: WorkerRef,
    state: WorkerState,
    commands: mpsc::UnboundedSender<WorkerCommand<H::Job>>,
    abort: AbortHandle,
    in_flight: HashMap<CorrelationId, InFlight<H::Output>>,
}

impl<H: JobHandler> WorkerSlot<H> {
    /// Reject every job this worker holds.
    fn reject_all(&mut self, fault: &WorkerFault) -> usize {
        let count = self.in_flight.len();
        for (correlation_id, job) in self.in_flight.drain() {
            tracing::debug!(
                worker = %self.worker,
                job = %correlation_id,
                held_for_ms = job.dispatched_at.elapsed().as_millis() as u64,
                "Rejecting job held by failed worker"
            );
            let _ = job.reply.send(Err(PoolError::WorkerFault(fault.clone())));
        }
        count
    }
}

struct Coordinator<H: JobHandler> {
    config: PoolConfig,
    factory: HandlerFactory<H>,
    queue: VecDeque<QueuedJob<H::Job, H::Output>>,
    slots: Vec<WorkerSlot<H>>,
    signals: EventSender<H::Output>,
    pending: Arc<AtomicUsize>,
    online: watch::Sender<usize>,
    closing: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl<H: JobHandler> Coordinator<H> {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request<H>>,
        mut signals: mpsc::UnboundedReceiver<Envelope<H::Output>>,
    ) {
        let mut requests_open = true;
        let shutdown_deadline = tokio::time::sleep(self.config.shutdown_timeout);
        tokio::pin!(shutdown_deadline);
        let mut deadline_armed = false;

        loop {
            tokio::select! {
                biased;

                Some(signal) = signals.recv() => match signal {
                    Envelope::Event(worker, event) => self.on_event(worker, event),
                    Envelope::Exit(worker, exit) => self.on_exit(worker, exit),
                },

                request = requests.recv(), if requests_open => match request {
                    Some(request) => self.on_request(request),
                    None => {
                        tracing::debug!("All pool handles dropped");
                        requests_open = false;
                        self.begin_shutdown();
                    }
                },

                () = &mut shutdown_deadline, if deadline_armed => {
                    deadline_armed = false;
                    self.abort_stragglers();
                }
            }

            if self.closing && !deadline_armed && self.has_live_workers() {
                shutdown_deadline
                    .as_mut()
                    .reset(tokio::time::Instant::now() + self.config.shutdown_timeout);
                deadline_armed = true;
            }

            if self.closing && !self.has_live_workers() {
                break;
            }
        }

        // Submissions that raced the exit are rejected here.
        requests.close();
        while let Ok(request) = requests.try_recv() {
            if let Request::Submit(job) = request {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                let _ = job.reply.send(Err(PoolError::Closed));
            }
        }

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        tracing::info!("Worker pool stopped");
    }

    fn on_request(&mut self, request: Request<H>) {
        match request {
            Request::Submit(job) => {
                if self.closing {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    let _ = job.reply.send(Err(PoolError::Closed));
                    return;
                }
                self.queue.push_back(job);
                self.dispatch();
            }
            Request::Stats(tx) => {
                let _ = tx.send(self.snapshot());
            }
            Request::Terminate { index, done } => {
                let killed = match self.slots.get(index) {
                    Some(slot) if slot.state != WorkerState::Terminated => {
                        tracing::warn!(worker = %slot.worker, "Terminating worker");
                        slot.abort.abort();
                        true
                    }
                    _ => false,
                };
                let _ = done.send(killed);
            }
            Request::Shutdown(waiter) => {
                self.shutdown_waiters.push(waiter);
                self.begin_shutdown();
            }
        }
    }

    fn on_event(&mut self, worker: WorkerRef, event: WorkerEvent<H::Output>) {
        let Some(slot) = self.slots.get_mut(worker.index) else {
            return;
        };
        if slot.worker.generation != worker.generation {
            tracing::debug!(worker = %worker, kind = event.kind(), "Ignoring event from stale worker");
            return;
        }

        match event {
            WorkerEvent::Online => {
                if slot.state == WorkerState::Spawning {
                    slot.state = WorkerState::Online;
                    tracing::debug!(worker = %worker, "Worker online");
                }
                self.publish_online();
            }
            WorkerEvent::Log {
                correlation_id,
                level,
                message,
            } => relay_log(worker, correlation_id, level, &message),
            WorkerEvent::Result {
                correlation_id,
                output,
            } => match slot.in_flight.remove(&correlation_id) {
                Some(job) => {
                    let _ = job.reply.send(Ok(output));
                }
                None => self.protocol_violation(worker, correlation_id),
            },
            WorkerEvent::Error {
                correlation_id,
                error,
            } => match slot.in_flight.remove(&correlation_id) {
                Some(job) => {
                    let _ = job.reply.send(Err(PoolError::Job(error)));
                }
                None => self.protocol_violation(worker, correlation_id),
            },
        }

        self.dispatch();
    }

    /// A terminal event for a job this worker does not hold. The worker's
    /// bookkeeping can no longer be trusted: reject its jobs and kill it.
    fn protocol_violation(&mut self, worker: WorkerRef, correlation_id: CorrelationId) {
        let slot = &mut self.slots[worker.index];
        let fault = WorkerFault::ProtocolViolation {
            index: worker.index,
            detail: format!("terminal event for unknown job {correlation_id}"),
        };
        tracing::error!(worker = %worker, error = %fault, "Terminating misbehaving worker");
        slot.reject_all(&fault);
        if slot.state != WorkerState::Stopping {
            slot.state = WorkerState::Crashed;
        }
        slot.abort.abort();
        self.publish_online();
    }

    fn on_exit(&mut self, worker: WorkerRef, exit: WorkerExit) {
        let closing = self.closing;
        let Some(slot) = self.slots.get_mut(worker.index) else {
            return;
        };
        if slot.worker.generation != worker.generation {
            return;
        }

        let fault = match &exit {
            WorkerExit::Clean => WorkerFault::Exited {
                index: worker.index,
            },
            WorkerExit::Crashed(reason) => WorkerFault::Crashed {
                index: worker.index,
                reason: reason.clone(),
            },
            WorkerExit::Aborted => WorkerFault::Terminated {
                index: worker.index,
            },
        };
        let rejected = slot.reject_all(&fault);

        if exit.code() == 0 || closing {
            tracing::info!(
                worker = %worker,
                exit_code = exit.code(),
                rejected,
                "Worker exited"
            );
            slot.state = WorkerState::Terminated;
        } else {
            tracing::error!(
                worker = %worker,
                exit_code = exit.code(),
                rejected,
                error = %fault,
                "Worker stopped unexpectedly, respawning"
            );
            let next = WorkerRef {
                index: worker.index,
                generation: worker.generation + 1,
            };
            let replacement = self.spawn_worker(next);
            self.slots[worker.index] = replacement;
        }

        self.publish_online();
        self.dispatch();
    }

    /// Pop queued jobs into free slots, walking workers in index order.
    fn dispatch(&mut self) {
        let limit = self.config.tasks_per_worker;
        for slot in self.slots.iter_mut() {
            if self.queue.is_empty() {
                break;
            }
            if slot.state != WorkerState::Online {
                continue;
            }
            while slot.in_flight.len() < limit {
                let Some(job) = self.queue.pop_front() else {
                    break;
                };
                self.pending.fetch_sub(1, Ordering::AcqRel);
                let correlation_id = CorrelationId::next();
                tracing::trace!(
                    worker = %slot.worker,
                    job = %correlation_id,
                    slot = slot.in_flight.len(),
                    queued_ms = job.queued_at.elapsed().as_millis() as u64,
                    "Dispatching job"
                );
                slot.in_flight.insert(
                    correlation_id,
                    InFlight {
                        reply: job.reply,
                        dispatched_at: Instant::now(),
                    },
                );
                let start = WorkerCommand::Start {
                    correlation_id,
                    data: job.data,
                };
                if slot.commands.send(start).is_err() {
                    // The task is gone; its exit signal rejects what it holds.
                    slot.state = WorkerState::Crashed;
                    break;
                }
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;

        let queued = self.queue.len();
        for job in self.queue.drain(..) {
            let _ = job.reply.send(Err(PoolError::Closed));
        }
        self.pending.fetch_sub(queued, Ordering::AcqRel);

        for slot in self.slots.iter_mut() {
            if slot.state == WorkerState::Terminated {
                continue;
            }
            if slot.state == WorkerState::Crashed || slot.commands.send(WorkerCommand::Stop).is_err() {
                slot.abort.abort();
            }
            slot.state = WorkerState::Stopping;
        }
        tracing::info!(rejected_queued = queued, "Worker pool shutting down");
        self.publish_online();
    }

    fn abort_stragglers(&mut self) {
        for slot in self.slots.iter() {
            if slot.state != WorkerState::Terminated {
                tracing::warn!(
                    worker = %slot.worker,
                    in_flight = slot.in_flight.len(),
                    "Worker did not stop in time, aborting"
                );
                slot.abort.abort();
            }
        }
    }

    fn has_live_workers(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.state != WorkerState::Terminated)
    }

    fn spawn_worker(&self, worker: WorkerRef) -> WorkerSlot<H> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let factory = Arc::clone(&self.factory);
        let events = self.signals.clone();

        let task = tokio::spawn(async move {
            let handler = factory(worker);
            JobWorker::new(worker, handler, commands_rx, events).run().await
        });
        let abort = task.abort_handle();

        let signals = self.signals.clone();
        tokio::spawn(async move {
            let exit = match task.await {
                Ok(exit) => exit,
                Err(e) if e.is_panic() => WorkerExit::Crashed(panic_message(e.into_panic().as_ref())),
                Err(_) => WorkerExit::Aborted,
            };
            let _ = signals.send(Envelope::Exit(worker, exit));
        });

        tracing::debug!(worker = %worker, "Spawned worker");
        WorkerSlot {
            worker,
            state: WorkerState::Spawning,
            commands: commands_tx,
            abort,
            in_flight: HashMap::new(),
        }
    }

    fn publish_online(&self) {
        let online = self
            .slots
            .iter()
            .filter(|slot| slot.state == WorkerState::Online)
            .count();
        self.online.send_replace(online);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            pending: self.queue.len(),
            workers: self
                .slots
                .iter()
                .map(|slot| WorkerStats {
                    index: slot.worker.index,
                    generation: slot.worker.generation,
                    state: slot.state,
                    in_flight: slot.in_flight.len(),
                })
                .collect(),
        }
    }
}

fn relay_log(
    worker: WorkerRef,
    correlation_id: Option<CorrelationId>,
    level: LogLevel,
    message: &str,
) {
    let job = correlation_id.map(CorrelationId::get);
    match level {
        LogLevel::Debug => tracing::debug!(worker = %worker, job, "{message}"),
        LogLevel::Info => tracing::info!(worker = %worker, job, "{message}"),
        LogLevel::Warn => tracing::warn!(worker = %worker, job, "{message}"),
        LogLevel::Error => tracing::error!(worker = %worker, job, "{message}"),
    }
}
