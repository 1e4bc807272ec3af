//! Engine façade: submission, scheduling, lifecycle and health.
//!
//! An [`Engine`] wires one [`JobQueue`], one [`Scheduler`] timer thread and
//! one [`WorkerPool`] around a caller-supplied [`JobExecutor`]. Jobs flow
//! scheduler → queue → worker; failures go back through the scheduler as
//! delayed retries or out to the dead-letter sink.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use async_trait::async_trait;
//! use job_engine::config::EngineConfig;
//! use job_engine::core::{Engine, JobContext, JobError, JobExecutor, JobOutcome, Priority};
//!
//! #[derive(Clone)]
//! struct Double;
//!
//! #[async_trait]
//! impl JobExecutor<u64, u64> for Double {
//!     async fn execute(&self, n: &u64, _ctx: JobContext) -> Result<u64, JobError> {
//!         Ok(n * 2)
//!     }
//! }
//!
//! let engine = Engine::new(EngineConfig::default(), Double).unwrap();
//! engine.start(2).unwrap();
//! let handle = engine.submit(21, Priority::NORMAL, 1).unwrap();
//! assert_eq!(handle.wait().unwrap(), JobOutcome::Completed(42));
//! engine.shutdown(true, Duration::from_secs(5));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::config::EngineConfig;
use crate::core::dead_letter::{DeadLetterSink, TracingDeadLetterSink};
use crate::core::error::{EngineError, SubmitError};
use crate::core::executor::JobExecutor;
use crate::core::handle::{JobHandle, Registry};
use crate::core::job::{CancellationToken, Job, JobId, JobIdGenerator, JobState, Priority};
use crate::core::queue::{EnqueueOutcome, JobQueue};
use crate::core::retry::{ExponentialBackoff, RetryPolicy};
use crate::core::scheduler::{PeriodicHandle, Scheduler, Trigger};
use crate::core::worker_pool::{
    CounterSnapshot, EngineCounters, WorkerId, WorkerPool, WorkerSettings, WorkerState,
};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Built; accepts submissions, no workers yet.
    Created,
    /// Workers and timer running.
    Running,
    /// `shutdown` in progress.
    ShuttingDown,
    /// Shut down; accepts nothing.
    Stopped,
}

impl EngineState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::ShuttingDown => 2,
            Self::Stopped => 3,
        }
    }
}

/// Handle returned by [`Engine::schedule`].
#[derive(Debug)]
pub enum ScheduledJob<R> {
    /// A one-shot job.
    Once(JobHandle<R>),
    /// A periodic series.
    Periodic(PeriodicHandle),
}

impl<R> ScheduledJob<R> {
    /// Job or series id.
    #[must_use]
    pub const fn id(&self) -> JobId {
        match self {
            Self::Once(handle) => handle.id(),
            Self::Periodic(handle) => handle.id(),
        }
    }
}

/// Summary of a shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Whether queued jobs were allowed to finish.
    pub drain: bool,
    /// Workers that exited within the timeout.
    pub workers_stopped: usize,
    /// Workers left running when the timeout elapsed.
    pub workers_detached: usize,
    /// Detached workers that were mid-job.
    pub still_busy: Vec<WorkerId>,
    /// Jobs discarded before they ever ran (resolved `Failed`).
    pub discarded: usize,
    /// Jobs awaiting a retry that were dead-lettered instead.
    pub dead_lettered: usize,
    /// Cancelled jobs resolved during shutdown.
    pub cancelled: usize,
    /// Jobs still queued for detached workers.
    pub still_queued: usize,
    /// Wall time spent in `shutdown`.
    pub elapsed_ms: u64,
}

impl ShutdownReport {
    /// Whether every worker exited in time.
    #[must_use]
    pub const fn completed_in_time(&self) -> bool {
        self.workers_detached == 0
    }

    fn tally(&mut self, state: JobState) {
        match state {
            JobState::DeadLettered => self.dead_lettered += 1,
            JobState::Cancelled => self.cancelled += 1,
            _ => self.discarded += 1,
        }
    }
}

/// Health snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Lifecycle state.
    pub state: EngineState,
    /// Jobs in the queue.
    pub queue_depth: usize,
    /// Queue bound.
    pub queue_capacity: usize,
    /// Workers executing a job.
    pub active_workers: usize,
    /// Workers counted toward the pool size.
    pub worker_count: usize,
    /// Age of the longest-waiting queued job.
    pub oldest_pending_age_ms: Option<u64>,
    /// Delayed jobs, retries and series waiting in the scheduler.
    pub scheduled_pending: usize,
    /// Periodic ticks skipped across all series.
    pub skipped_ticks: u64,
    /// Submitted jobs not yet resolved.
    pub outstanding_jobs: usize,
    /// Time since the engine was built.
    pub uptime_ms: u64,
    /// Lifetime counters.
    pub counters: CounterSnapshot,
}

impl HealthReport {
    /// Running with at least one worker.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == EngineState::Running && self.worker_count > 0
    }
}

enum Admission {
    Immediate,
    Blocking(Option<Duration>),
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Concurrent job-processing engine.
pub struct Engine<P, R, E>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    config: EngineConfig,
    ids: Arc<JobIdGenerator>,
    queue: Arc<JobQueue<P>>,
    scheduler: Arc<Scheduler<P>>,
    registry: Arc<Registry<R>>,
    counters: Arc<EngineCounters>,
    pool: WorkerPool<P, R, E>,
    lifecycle: AtomicU8,
    created: Instant,
}

impl<P, R, E> Engine<P, R, E>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    /// Build an engine with exponential backoff from `config.retry` and a
    /// tracing dead-letter sink.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: EngineConfig, executor: E) -> Result<Self, EngineError> {
        let retry = ExponentialBackoff::new(
            Duration::from_millis(config.retry.base_delay_ms),
            Duration::from_millis(config.retry.max_delay_ms),
        );
        Self::with_parts(config, executor, Arc::new(retry), Arc::new(TracingDeadLetterSink))
    }

    /// Build an engine with an explicit retry policy and dead-letter sink.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] if `config` fails validation.
    pub fn with_parts(
        config: EngineConfig,
        executor: E,
        retry: Arc<dyn RetryPolicy>,
        dead_letter: Arc<dyn DeadLetterSink<P>>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;

        let ids = Arc::new(JobIdGenerator::new());
        let queue = Arc::new(JobQueue::new(config.queue.capacity));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&ids),
            config.requeue_delay(),
        ));
        let registry = Arc::new(Registry::new());
        let counters = Arc::new(EngineCounters::default());
        let pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&scheduler),
            executor,
            retry,
            dead_letter,
            Arc::clone(&registry),
            Arc::clone(&counters),
            WorkerSettings {
                thread_name_prefix: config.pool.thread_name_prefix.clone(),
                stack_size: config.pool.thread_stack_size,
                idle_poll: config.idle_poll(),
            },
        );

        debug!(
            generation = ids.generation(),
            queue_capacity = config.queue.capacity,
            "engine created"
        );
        Ok(Self {
            config,
            ids,
            queue,
            scheduler,
            registry,
            counters,
            pool,
            lifecycle: AtomicU8::new(EngineState::Created.as_u8()),
            created: Instant::now(),
        })
    }

    /// Start the scheduler timer and `pool_size` workers.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyStarted`], [`EngineError::ShuttingDown`] or
    /// [`EngineError::Spawn`].
    pub fn start(&self, pool_size: usize) -> Result<(), EngineError> {
        if let Err(current) = self.lifecycle.compare_exchange(
            EngineState::Created.as_u8(),
            EngineState::Running.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match EngineState::from_u8(current) {
                EngineState::Running => EngineError::AlreadyStarted,
                _ => EngineError::ShuttingDown,
            });
        }
        self.scheduler.start(&self.config.scheduler.thread_name)?;
        self.pool.start(pool_size)?;
        info!(worker_count = pool_size, "engine started");
        Ok(())
    }

    /// Start with `config.pool.worker_count` workers.
    ///
    /// # Errors
    ///
    /// See [`Engine::start`].
    pub fn start_default(&self) -> Result<(), EngineError> {
        self.start(self.config.pool.worker_count)
    }

    /// Queue a job without blocking.
    ///
    /// # Errors
    ///
    /// [`SubmitError::Rejected`] when the queue is full,
    /// [`SubmitError::ShuttingDown`] once shutdown has begun.
    pub fn submit(
        &self,
        payload: P,
        priority: Priority,
        max_attempts: u32,
    ) -> Result<JobHandle<R>, SubmitError<P>> {
        self.admit(payload, priority, max_attempts, Admission::Immediate)
    }

    /// Queue a job, blocking while the queue is full (at most `timeout`
    /// when given).
    ///
    /// # Errors
    ///
    /// [`SubmitError::TimedOut`] or [`SubmitError::ShuttingDown`].
    pub fn submit_blocking(
        &self,
        payload: P,
        priority: Priority,
        max_attempts: u32,
        timeout: Option<Duration>,
    ) -> Result<JobHandle<R>, SubmitError<P>> {
        self.admit(payload, priority, max_attempts, Admission::Blocking(timeout))
    }

    /// Release a job into the queue at `at`. A full queue at that time delays
    /// the job instead of refusing it.
    ///
    /// # Errors
    ///
    /// [`SubmitError::ShuttingDown`] once shutdown has begun.
    pub fn schedule_at(
        &self,
        payload: P,
        at: Instant,
        priority: Priority,
        max_attempts: u32,
    ) -> Result<JobHandle<R>, SubmitError<P>> {
        if self.is_closing() {
            return Err(SubmitError::ShuttingDown(payload));
        }
        let (job, handle) = self.track(payload, priority, max_attempts);
        match self.scheduler.schedule_once(job, at) {
            Ok(()) => {
                self.counters.submitted.increment();
                Ok(handle)
            }
            Err(job) => {
                self.registry.forget(job.id());
                Err(SubmitError::ShuttingDown(job.into_payload()))
            }
        }
    }

    /// Release a job into the queue after `delay`.
    ///
    /// # Errors
    ///
    /// See [`Engine::schedule_at`].
    pub fn schedule_after(
        &self,
        payload: P,
        delay: Duration,
        priority: Priority,
        max_attempts: u32,
    ) -> Result<JobHandle<R>, SubmitError<P>> {
        self.schedule_at(payload, Instant::now() + delay, priority, max_attempts)
    }

    /// Start a periodic series: one occurrence now, then one every
    /// `interval`, skipping ticks while the previous occurrence is still
    /// outstanding. `factory` builds each occurrence's payload.
    ///
    /// # Errors
    ///
    /// [`EngineError::ShuttingDown`] once shutdown has begun.
    pub fn schedule_every<F>(
        &self,
        factory: F,
        interval: Duration,
        priority: Priority,
        max_attempts: u32,
    ) -> Result<PeriodicHandle, EngineError>
    where
        F: Fn() -> P + Send + Sync + 'static,
    {
        if self.is_closing() {
            return Err(EngineError::ShuttingDown);
        }
        let id = self.ids.next_id();
        self.scheduler
            .schedule_series(id, interval, priority, max_attempts, Arc::new(factory))
    }

    /// Schedule by [`Trigger`]. Periodic triggers clone the payload for every
    /// occurrence.
    ///
    /// # Errors
    ///
    /// [`SubmitError::ShuttingDown`] once shutdown has begun.
    pub fn schedule(
        &self,
        payload: P,
        trigger: Trigger,
        priority: Priority,
        max_attempts: u32,
    ) -> Result<ScheduledJob<R>, SubmitError<P>>
    where
        P: Clone,
    {
        let handle = match trigger {
            Trigger::Immediate => {
                self.schedule_at(payload, Instant::now(), priority, max_attempts)?
            }
            Trigger::At(at) => self.schedule_at(payload, at, priority, max_attempts)?,
            Trigger::After(delay) => self.schedule_after(payload, delay, priority, max_attempts)?,
            Trigger::Every(interval) => {
                let fallback = payload.clone();
                return self
                    .schedule_every(move || payload.clone(), interval, priority, max_attempts)
                    .map(ScheduledJob::Periodic)
                    .map_err(|_| SubmitError::ShuttingDown(fallback));
            }
        };
        Ok(ScheduledJob::Once(handle))
    }

    /// Request cancellation of a job or periodic series. Returns `false` if
    /// the id is unknown or already resolved.
    pub fn cancel(&self, id: JobId) -> bool {
        let found = self.registry.cancel(id) || self.scheduler.cancel_series(id);
        debug!(job_id = %id, found, "cancel requested");
        found
    }

    /// Grow or shrink the worker pool.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotStarted`], [`EngineError::ShuttingDown`] or
    /// [`EngineError::Spawn`].
    pub fn resize(&self, new_size: usize) -> Result<(), EngineError> {
        match self.state() {
            EngineState::Running => self.pool.resize(new_size),
            EngineState::Created => Err(EngineError::NotStarted),
            EngineState::ShuttingDown | EngineState::Stopped => Err(EngineError::ShuttingDown),
        }
    }

    /// Stop accepting work and wind down.
    ///
    /// Delayed jobs and pending retries are resolved immediately (see
    /// [`ShutdownReport`]) and periodic series stop ticking. With `drain`,
    /// queued jobs (periodic occurrences included) still run; without it
    /// they are resolved `Failed`. Workers get up to `timeout` to finish their
    /// current job; stragglers are detached, never killed. A second call
    /// returns an empty report.
    pub fn shutdown(&self, drain: bool, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let mut report = ShutdownReport {
            drain,
            ..ShutdownReport::default()
        };
        if !self.begin_shutdown() {
            return report;
        }
        info!(drain, timeout_ms = millis(timeout), "engine shutting down");

        let ctx = self.pool.context();
        for job in self.scheduler.shutdown() {
            report.tally(ctx.abandon_on_shutdown(job));
        }
        for job in self.queue.shutdown(drain) {
            report.tally(ctx.abandon_on_shutdown(job));
        }

        let pool = self.pool.shutdown(timeout);
        if pool.detached == 0 {
            // no worker is left to take what remains
            for job in self.queue.shutdown(false) {
                report.tally(ctx.abandon_on_shutdown(job));
            }
        }

        report.workers_stopped = pool.stopped;
        report.workers_detached = pool.detached;
        report.still_busy = pool.still_busy;
        report.still_queued = self.queue.len();
        report.elapsed_ms = millis(started.elapsed());
        self.lifecycle
            .store(EngineState::Stopped.as_u8(), Ordering::Release);

        info!(
            workers_stopped = report.workers_stopped,
            workers_detached = report.workers_detached,
            discarded = report.discarded,
            dead_lettered = report.dead_lettered,
            elapsed_ms = report.elapsed_ms,
            "engine shut down"
        );
        report
    }

    /// Shut down with `drain` and the configured timeout.
    pub fn shutdown_default(&self, drain: bool) -> ShutdownReport {
        self.shutdown(drain, self.config.shutdown_timeout())
    }

    /// Current health snapshot.
    #[must_use]
    pub fn health_check(&self) -> HealthReport {
        HealthReport {
            state: self.state(),
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            active_workers: self.pool.active_workers(),
            worker_count: self.pool.worker_count(),
            oldest_pending_age_ms: self.queue.oldest_pending_age().map(millis),
            scheduled_pending: self.scheduler.pending(),
            skipped_ticks: self.scheduler.skipped_ticks(),
            outstanding_jobs: self.registry.len(),
            uptime_ms: millis(self.created.elapsed()),
            counters: self.counters.snapshot(),
        }
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// State of every live worker.
    #[must_use]
    pub fn worker_states(&self) -> Vec<(WorkerId, WorkerState)> {
        self.pool.worker_states()
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn is_closing(&self) -> bool {
        matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped)
    }

    fn begin_shutdown(&self) -> bool {
        self.lifecycle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match EngineState::from_u8(current) {
                    EngineState::Created | EngineState::Running => {
                        Some(EngineState::ShuttingDown.as_u8())
                    }
                    EngineState::ShuttingDown | EngineState::Stopped => None,
                }
            })
            .is_ok()
    }

    fn track(&self, payload: P, priority: Priority, max_attempts: u32) -> (Job<P>, JobHandle<R>) {
        let id = self.ids.next_id();
        let cancellation = CancellationToken::new();
        let rx = self.registry.register(id, cancellation.clone());
        let job =
            Job::new(id, payload, priority, max_attempts).with_cancellation(cancellation.clone());
        (job, JobHandle::new(id, cancellation, rx))
    }

    fn admit(
        &self,
        payload: P,
        priority: Priority,
        max_attempts: u32,
        admission: Admission,
    ) -> Result<JobHandle<R>, SubmitError<P>> {
        if self.is_closing() {
            return Err(SubmitError::ShuttingDown(payload));
        }
        let (job, handle) = self.track(payload, priority, max_attempts);
        let outcome = match admission {
            Admission::Immediate => self.queue.enqueue(job, false),
            Admission::Blocking(None) => self.queue.enqueue(job, true),
            Admission::Blocking(Some(timeout)) => self.queue.enqueue_timeout(job, timeout),
        };

        match outcome {
            EnqueueOutcome::Accepted | EnqueueOutcome::BlockedThenAccepted => {
                self.counters.submitted.increment();
                trace!(job_id = %handle.id(), %priority, "job submitted");
                Ok(handle)
            }
            EnqueueOutcome::Rejected(job) => {
                self.registry.forget(job.id());
                self.counters.rejected.increment();
                debug!(job_id = %job.id(), "queue full, job rejected");
                Err(SubmitError::Rejected(job.into_payload()))
            }
            EnqueueOutcome::TimedOut(job) => {
                self.registry.forget(job.id());
                self.counters.rejected.increment();
                debug!(job_id = %job.id(), "timed out waiting for queue capacity");
                Err(SubmitError::TimedOut(job.into_payload()))
            }
            EnqueueOutcome::ShuttingDown(job) => {
                self.registry.forget(job.id());
                Err(SubmitError::ShuttingDown(job.into_payload()))
            }
        }
    }
}

impl<P, R, E> Drop for Engine<P, R, E>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    fn drop(&mut self) {
        // Signal shutdown but don't wait for workers; they exit on their own
        if self.begin_shutdown() {
            let ctx = self.pool.context();
            for job in self.scheduler.shutdown() {
                ctx.abandon_on_shutdown(job);
            }
            for job in self.queue.shutdown(false) {
                ctx.abandon_on_shutdown(job);
            }
            self.lifecycle
                .store(EngineState::Stopped.as_u8(), Ordering::Release);
            debug!("engine dropped without explicit shutdown - workers will be detached");
        }
    }
}

impl<P, R, E> fmt::Debug for Engine<P, R, E>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("generation", &self.ids.generation())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
