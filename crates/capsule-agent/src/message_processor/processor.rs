// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic asynchronous job runner.
//!
//! Jobs are persisted through a [`MessageStore`] and dispatched from one FIFO
//! queue to a fixed pool of dispatcher tasks. Each attempt runs in isolation:
//! a panicking or hung worker is reported as a retryable failure and never
//! takes a dispatcher down.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use capsule_core::persistence::MessageStore;
use capsule_core::{Job, JobStatus, StoreError};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::worker::{JobError, Worker};
use crate::events::{Event, EventBus, EventPayload};

/// Message processor errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessorError {
    /// A worker is already registered for this job type.
    #[error("Worker already registered for job type '{0}'")]
    AlreadyRegistered(String),

    /// The processor has started; the worker registry is closed.
    #[error("Message processor already started")]
    AlreadyStarted,

    /// No worker is registered for this job type.
    #[error("No worker registered for job type '{0}'")]
    UnknownJobType(String),

    /// The job payload could not be encoded.
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    /// The pending queue is at capacity.
    #[error("Job queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured admission bound.
        capacity: usize,
    },

    /// The processor has been stopped.
    #[error("Message processor is shutting down")]
    ShuttingDown,

    /// Dispatchers were still busy when the drain timeout elapsed.
    #[error("Drain timeout elapsed with {} job(s) in flight", .abandoned.len())]
    DrainTimeout {
        /// Ids of the jobs that were abandoned mid-flight.
        abandoned: Vec<String>,
    },

    /// The message store failed.
    #[error("Message store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for message processor operations.
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Configuration for the message processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of dispatcher tasks.
    pub workers: usize,
    /// Maximum pending jobs accepted from producers.
    pub queue_capacity: usize,
    /// Retry budget for jobs created through [`MessageProcessor::submit`].
    pub default_max_retries: u32,
    /// Upper bound for a single attempt.
    pub job_timeout: Duration,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_base_delay: Duration,
    /// Cap on the retry delay.
    pub retry_max_delay: Duration,
    /// How long `stop` waits for in-flight jobs.
    pub drain_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            default_max_retries: capsule_core::job::DEFAULT_MAX_RETRIES,
            job_timeout: Duration::from_secs(900),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot of processor activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Jobs waiting for a dispatcher.
    pub pending: usize,
    /// Failed jobs waiting out their retry delay.
    pub delayed: usize,
    /// Jobs currently being processed.
    pub in_flight: usize,
    /// Registered job types, sorted.
    pub job_types: Vec<String>,
    /// Whether dispatchers are running.
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

struct QueueState {
    lifecycle: Lifecycle,
    pending: VecDeque<Job>,
    /// Admission slots held by enqueues that are persisting their job.
    reserved: usize,
    delayed: usize,
    in_flight: HashMap<String, String>,
}

struct Shared {
    config: ProcessorConfig,
    store: Arc<dyn MessageStore>,
    bus: EventBus,
    workers: RwLock<HashMap<String, Arc<dyn Worker>>>,
    queue: Mutex<QueueState>,
    available: Notify,
    shutdown_tx: watch::Sender<bool>,
}

/// Outcome of one attempt.
enum Attempt {
    Done,
    Failed(JobError),
}

/// Asynchronous job runner with a fixed dispatcher pool.
pub struct MessageProcessor {
    shared: Arc<Shared>,
    dispatchers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MessageProcessor {
    /// Create a processor. Nothing is dispatched until [`start`](Self::start).
    pub fn new(config: ProcessorConfig, store: Arc<dyn MessageStore>, bus: EventBus) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                bus,
                workers: RwLock::new(HashMap::new()),
                queue: Mutex::new(QueueState {
                    lifecycle: Lifecycle::Created,
                    pending: VecDeque::new(),
                    reserved: 0,
                    delayed: 0,
                    in_flight: HashMap::new(),
                }),
                available: Notify::new(),
                shutdown_tx,
            }),
            dispatchers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Associate a job type with a worker.
    ///
    /// Fails if the type is taken or the processor has started.
    pub fn register_worker(
        &self,
        job_type: impl Into<String>,
        worker: Arc<dyn Worker>,
    ) -> Result<()> {
        let job_type = job_type.into();
        let queue = self.shared.lock_queue();
        if queue.lifecycle != Lifecycle::Created {
            return Err(ProcessorError::AlreadyStarted);
        }
        let mut workers = self.shared.write_workers();
        if workers.contains_key(&job_type) {
            return Err(ProcessorError::AlreadyRegistered(job_type));
        }
        debug!(job_type = %job_type, "Worker registered");
        workers.insert(job_type, worker);
        Ok(())
    }

    /// Create and enqueue a job with the configured retry budget.
    pub async fn submit(&self, job_type: impl Into<String>, payload: Value) -> Result<String> {
        let job = Job::new(job_type, payload).with_max_retries(self.shared.config.default_max_retries);
        self.enqueue(job).await
    }

    /// Accept a job for dispatch and return its id.
    ///
    /// Never waits for queue space: a saturated queue fails immediately with
    /// [`ProcessorError::QueueFull`].
    pub async fn enqueue(&self, mut job: Job) -> Result<String> {
        job.status = JobStatus::Pending;
        let capacity = self.shared.config.queue_capacity;

        {
            let mut queue = self.shared.lock_queue();
            match queue.lifecycle {
                Lifecycle::Stopped => return Err(ProcessorError::ShuttingDown),
                Lifecycle::Running if !self.shared.read_workers().contains_key(&job.job_type) => {
                    return Err(ProcessorError::UnknownJobType(job.job_type));
                }
                _ => {}
            }
            if queue.pending.len() + queue.reserved >= capacity {
                debug!(job_type = %job.job_type, capacity, "Job rejected, queue full");
                return Err(ProcessorError::QueueFull { capacity });
            }
            queue.reserved += 1;
        }

        if let Err(e) = self.shared.store.save(&job).await {
            self.shared.lock_queue().reserved -= 1;
            return Err(e.into());
        }

        let id = job.id.clone();
        {
            let mut queue = self.shared.lock_queue();
            queue.reserved -= 1;
            debug!(job_id = %id, job_type = %job.job_type, "Job enqueued");
            queue.pending.push_back(job);
        }
        self.shared.available.notify_one();

        Ok(id)
    }

    /// Recover unfinished jobs from the store and spawn the dispatcher pool.
    ///
    /// Jobs left `Processing` by a previous process are reset to `Pending`.
    pub async fn start(&self) -> Result<()> {
        {
            let queue = self.shared.lock_queue();
            match queue.lifecycle {
                Lifecycle::Created => {}
                Lifecycle::Running => return Err(ProcessorError::AlreadyStarted),
                Lifecycle::Stopped => return Err(ProcessorError::ShuttingDown),
            }
        }

        let mut recovered = Vec::new();
        for mut job in self.shared.store.load_pending().await? {
            if job.status == JobStatus::Processing {
                warn!(job_id = %job.id, job_type = %job.job_type, "Recovering job abandoned mid-flight");
                job.status = JobStatus::Pending;
                self.shared.store.save(&job).await?;
            }
            recovered.push(job);
        }

        let recovered_count;
        {
            let mut queue = self.shared.lock_queue();
            if queue.lifecycle != Lifecycle::Created {
                return Err(ProcessorError::AlreadyStarted);
            }
            let queued: HashSet<String> = queue.pending.iter().map(|j| j.id.clone()).collect();
            let mut ordered: VecDeque<Job> = recovered
                .into_iter()
                .filter(|j| !queued.contains(&j.id))
                .collect();
            recovered_count = ordered.len();
            ordered.extend(queue.pending.drain(..));
            queue.pending = ordered;
            queue.lifecycle = Lifecycle::Running;
        }

        let mut dispatchers = self.dispatchers.lock().await;
        for index in 0..self.shared.config.workers.max(1) {
            let shared = self.shared.clone();
            dispatchers.push(tokio::spawn(async move {
                shared.dispatch_loop(index).await;
            }));
        }

        info!(
            workers = dispatchers.len(),
            queue_capacity = self.shared.config.queue_capacity,
            recovered = recovered_count,
            job_types = ?self.stats().job_types,
            "Message processor started"
        );
        Ok(())
    }

    /// Stop dispatching and wait for in-flight jobs.
    ///
    /// Dispatchers finish their current job and take no new ones. Jobs still
    /// pending stay `Pending` in the store for the next start. If the drain
    /// timeout elapses, the remaining dispatchers are aborted and their jobs
    /// reported in [`ProcessorError::DrainTimeout`].
    pub async fn stop(&self) -> Result<()> {
        {
            let mut queue = self.shared.lock_queue();
            let was = queue.lifecycle;
            queue.lifecycle = Lifecycle::Stopped;
            if was != Lifecycle::Running {
                return Ok(());
            }
        }
        info!("Message processor stopping...");
        self.shared.shutdown_tx.send_replace(true);
        self.shared.available.notify_waiters();

        let mut dispatchers = std::mem::take(&mut *self.dispatchers.lock().await);
        let drain = futures::future::join_all(dispatchers.iter_mut());
        let drained = tokio::time::timeout(self.shared.config.drain_timeout, drain).await;
        match drained {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Dispatcher task panicked: {}", e);
                    }
                }
                let pending = self.shared.lock_queue().pending.len();
                info!(left_pending = pending, "Message processor stopped");
                Ok(())
            }
            Err(_) => {
                for handle in &dispatchers {
                    handle.abort();
                }
                let mut abandoned: Vec<String> =
                    self.shared.lock_queue().in_flight.keys().cloned().collect();
                abandoned.sort();
                error!(
                    abandoned = ?abandoned,
                    drain_timeout_secs = self.shared.config.drain_timeout.as_secs(),
                    "Drain timeout elapsed, in-flight jobs abandoned"
                );
                Err(ProcessorError::DrainTimeout { abandoned })
            }
        }
    }

    /// Snapshot of queue and dispatcher activity.
    pub fn stats(&self) -> ProcessorStats {
        let mut job_types: Vec<String> = self.shared.read_workers().keys().cloned().collect();
        job_types.sort();
        let queue = self.shared.lock_queue();
        ProcessorStats {
            pending: queue.pending.len(),
            delayed: queue.delayed,
            in_flight: queue.in_flight.len(),
            job_types,
            running: queue.lifecycle == Lifecycle::Running,
        }
    }

    /// Read a job through the message store.
    pub async fn job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.shared.store.get_job(id).await?)
    }
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_workers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Worker>>> {
        self.workers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_workers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn Worker>>> {
        self.workers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Take the next pending job and mark it in flight, unless shutting down.
    fn next_job(&self) -> Option<Job> {
        let mut queue = self.lock_queue();
        if queue.lifecycle != Lifecycle::Running {
            return None;
        }
        let job = queue.pending.pop_front()?;
        queue.in_flight.insert(job.id.clone(), job.job_type.clone());
        Some(job)
    }

    async fn dispatch_loop(self: Arc<Self>, index: usize) {
        debug!(dispatcher = index, "Dispatcher started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shutting_down() {
                break;
            }

            match self.next_job() {
                Some(job) => self.run_job(job).await,
                None => {
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.changed() => {}
                        _ = &mut notified => {}
                    }
                }
            }
        }

        debug!(dispatcher = index, "Dispatcher stopped");
    }

    async fn run_job(self: &Arc<Self>, mut job: Job) {
        job.status = JobStatus::Processing;
        job.last_attempt_at = Some(Utc::now());
        if let Err(e) = self.store.save(&job).await {
            error!(job_id = %job.id, error = %e, "Failed to persist job as processing");
        }

        let worker = self.read_workers().get(&job.job_type).cloned();
        let attempt = match worker {
            Some(worker) => self.attempt(worker.as_ref(), &job).await,
            None => Attempt::Failed(JobError::Permanent(format!(
                "no worker registered for job type '{}'",
                job.job_type
            ))),
        };

        match attempt {
            Attempt::Done => {
                job.status = JobStatus::Done;
                job.last_error = None;
                debug!(job_id = %job.id, job_type = %job.job_type, retry_count = job.retry_count, "Job done");
                self.finish(job).await;
            }
            Attempt::Failed(err) if err.is_retryable() && job.has_retries_left() => {
                job.retry_count += 1;
                job.status = JobStatus::Pending;
                job.last_error = Some(err.to_string());
                let delay = retry_delay(
                    self.config.retry_base_delay,
                    self.config.retry_max_delay,
                    job.retry_count,
                );
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    retry_count = job.retry_count,
                    max_retries = job.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Job failed, scheduling retry"
                );
                self.schedule_retry(job, delay).await;
            }
            Attempt::Failed(err) => {
                job.status = JobStatus::Failed;
                job.last_error = Some(err.to_string());
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    retry_count = job.retry_count,
                    error = %err,
                    "Job failed permanently"
                );
                self.finish(job).await;
            }
        }
    }

    /// Run one attempt with panic isolation and the per-job timeout.
    async fn attempt(&self, worker: &dyn Worker, job: &Job) -> Attempt {
        let timeout = self.config.job_timeout;
        let run = AssertUnwindSafe(worker.process(job)).catch_unwind();
        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(Ok(()))) => Attempt::Done,
            Ok(Ok(Err(e))) => Attempt::Failed(e),
            Ok(Err(panic)) => Attempt::Failed(JobError::Retryable(format!(
                "worker panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Attempt::Failed(JobError::Retryable(format!(
                "attempt timed out after {timeout:?}"
            ))),
        }
    }

    /// Persist a terminal job and publish its completion.
    async fn finish(&self, job: Job) {
        if let Err(e) = self.store.save(&job).await {
            error!(job_id = %job.id, error = %e, "Failed to persist finished job");
        }
        self.lock_queue().in_flight.remove(&job.id);
        self.bus.publish(Event::new(EventPayload::JobCompleted {
            job_id: job.id,
            job_type: job.job_type,
            status: job.status,
            retry_count: job.retry_count,
            error: job.last_error,
        }));
    }

    /// Persist a retryable job as pending and re-admit it after `delay`.
    async fn schedule_retry(self: &Arc<Self>, job: Job, delay: Duration) {
        if let Err(e) = self.store.save(&job).await {
            error!(job_id = %job.id, error = %e, "Failed to persist job retry");
        }
        {
            let mut queue = self.lock_queue();
            queue.in_flight.remove(&job.id);
            queue.delayed += 1;
        }

        let shared = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let stopping = *shutdown_rx.borrow();
            let readmit = !stopping
                && tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => false,
                    _ = tokio::time::sleep(delay) => true,
                };
            {
                let mut queue = shared.lock_queue();
                queue.delayed -= 1;
                if !readmit || queue.lifecycle != Lifecycle::Running {
                    debug!(job_id = %job.id, "Retry left pending for next start");
                    return;
                }
                queue.pending.push_back(job);
            }
            shared.available.notify_one();
        });
    }
}

/// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`, capped at `max`.
pub(crate) fn retry_delay(base: Duration, max: Duration, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
