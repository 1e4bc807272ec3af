//! Elastic pool of worker threads consuming the shared job queue.
//!
//! Each worker is a dedicated OS thread with its own single-threaded tokio
//! runtime, so CPU-bound job bodies never block the caller's async runtime.
//! Workers are kept in an indexed map so the pool can grow or shrink while
//! running: retirement is a flag the worker observes between jobs, never
//! mid-job.
//!
//! Everything a worker needs is bundled in one [`PoolContext`] shared by
//! `Arc`; there is no global state.

mod worker;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::dead_letter::DeadLetterSink;
use crate::core::error::EngineError;
use crate::core::executor::JobExecutor;
use crate::core::handle::{JobOutcome, Registry};
use crate::core::job::{Job, JobError, JobState};
use crate::core::queue::JobQueue;
use crate::core::retry::RetryPolicy;
use crate::core::scheduler::Scheduler;
use crate::counter::AtomicCounter;
use crate::mutex::{lock_order, Mutex};

/// Worker identifier, unique within a pool.
pub type WorkerId = u64;

/// Lifecycle state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for a job.
    Idle,
    /// Executing a job.
    Busy,
    /// Asked to retire; exits before taking another job.
    Draining,
    /// Thread has exited.
    Stopped,
}

impl WorkerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Busy,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Busy => 1,
            Self::Draining => 2,
            Self::Stopped => 3,
        }
    }
}

/// Lock-free cell holding a [`WorkerState`].
#[derive(Debug)]
pub(crate) struct WorkerStatus(AtomicU8);

impl WorkerStatus {
    fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Idle.as_u8()))
    }

    pub(crate) fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: WorkerState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Jobs accepted by `submit`/`schedule`.
    pub submitted: u64,
    /// Submissions refused for capacity.
    pub rejected: u64,
    /// Jobs that completed successfully.
    pub completed: u64,
    /// Failed attempts (a job can fail several times).
    pub failed_attempts: u64,
    /// Retries handed to the scheduler.
    pub retried: u64,
    /// Jobs abandoned to the dead-letter sink.
    pub dead_lettered: u64,
    /// Jobs resolved as cancelled.
    pub cancelled: u64,
    /// Job bodies that panicked.
    pub panicked: u64,
}

/// Internal counters for engine statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub submitted: AtomicCounter,
    pub rejected: AtomicCounter,
    pub completed: AtomicCounter,
    pub failed_attempts: AtomicCounter,
    pub retried: AtomicCounter,
    pub dead_lettered: AtomicCounter,
    pub cancelled: AtomicCounter,
    pub panicked: AtomicCounter,
    pub active_workers: AtomicCounter,
}

impl EngineCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            submitted: self.submitted.load(),
            rejected: self.rejected.load(),
            completed: self.completed.load(),
            failed_attempts: self.failed_attempts.load(),
            retried: self.retried.load(),
            dead_lettered: self.dead_lettered.load(),
            cancelled: self.cancelled.load(),
            panicked: self.panicked.load(),
        }
    }
}

/// Thread settings for spawned workers.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
    pub idle_poll: Duration,
}

/// Everything workers share. Built once per engine.
pub(crate) struct PoolContext<P, R, E> {
    pub queue: Arc<JobQueue<P>>,
    pub scheduler: Arc<Scheduler<P>>,
    pub executor: E,
    pub retry: Arc<dyn RetryPolicy>,
    pub dead_letter: Arc<dyn DeadLetterSink<P>>,
    pub registry: Arc<Registry<R>>,
    pub counters: Arc<EngineCounters>,
    pub settings: WorkerSettings,
    exits: Sender<WorkerId>,
}

impl<P, R, E> PoolContext<P, R, E>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    /// Record a job as abandoned and resolve its handle with the history.
    pub fn dead_letter(&self, mut job: Job<P>) {
        job.set_state(JobState::DeadLettered);
        self.dead_letter.record(&job, job.failures());
        self.counters.dead_lettered.increment();
        let history = job.failures().to_vec();
        debug!(job_id = %job.id(), attempts = job.attempts(), "job dead-lettered");
        self.registry.resolve(job.id(), JobOutcome::DeadLettered(history));
    }

    /// Resolve a job that shutdown took away before it could run (again).
    /// Jobs that already failed are dead-lettered with a final shutdown
    /// record; jobs that never ran are resolved `Failed`. Returns the final
    /// state.
    pub fn abandon_on_shutdown(&self, mut job: Job<P>) -> JobState {
        if job.is_cancelled() {
            self.cancel(job);
            JobState::Cancelled
        } else if job.attempts() > 0 {
            job.record_failure(JobError::permanent("engine shut down before retry"));
            self.dead_letter(job);
            JobState::DeadLettered
        } else {
            job.set_state(JobState::Failed);
            self.registry.resolve(
                job.id(),
                JobOutcome::Failed(JobError::permanent("engine shut down before the job ran")),
            );
            JobState::Failed
        }
    }

    /// Resolve a job as cancelled.
    pub fn cancel(&self, mut job: Job<P>) {
        job.set_state(JobState::Cancelled);
        self.counters.cancelled.increment();
        debug!(job_id = %job.id(), attempts = job.attempts(), "job cancelled");
        self.registry.resolve(job.id(), JobOutcome::Cancelled);
    }
}

struct WorkerSlot {
    retire: Arc<AtomicBool>,
    status: Arc<WorkerStatus>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slots {
    active: BTreeMap<WorkerId, WorkerSlot>,
    retiring: BTreeMap<WorkerId, WorkerSlot>,
    next_id: WorkerId,
    started: bool,
}

impl Slots {
    fn reap_retired(&mut self) {
        self.retiring.retain(|_, slot| !slot.handle.is_finished());
    }
}

/// What the pool reports once shutdown stops waiting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolShutdown {
    /// Workers that exited in time.
    pub stopped: usize,
    /// Workers that had not exited when the timeout elapsed; left detached.
    pub detached: usize,
    /// Detached workers that were executing a job.
    pub still_busy: Vec<WorkerId>,
}

/// Pool of worker threads.
pub struct WorkerPool<P, R, E> {
    ctx: Arc<PoolContext<P, R, E>>,
    slots: Mutex<Slots>,
    exits: Receiver<WorkerId>,
}

impl<P, R, E> WorkerPool<P, R, E>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: Arc<JobQueue<P>>,
        scheduler: Arc<Scheduler<P>>,
        executor: E,
        retry: Arc<dyn RetryPolicy>,
        dead_letter: Arc<dyn DeadLetterSink<P>>,
        registry: Arc<Registry<R>>,
        counters: Arc<EngineCounters>,
        settings: WorkerSettings,
    ) -> Self {
        let (exits_tx, exits_rx) = unbounded();
        Self {
            ctx: Arc::new(PoolContext {
                queue,
                scheduler,
                executor,
                retry,
                dead_letter,
                registry,
                counters,
                settings,
                exits: exits_tx,
            }),
            slots: Mutex::ranked(lock_order::POOL, "worker_pool", Slots::default()),
            exits: exits_rx,
        }
    }

    pub(crate) fn context(&self) -> &PoolContext<P, R, E> {
        &self.ctx
    }

    /// Spawn `size` workers.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyStarted`] or [`EngineError::Spawn`]. Workers
    /// spawned before a spawn failure keep running.
    pub fn start(&self, size: usize) -> Result<(), EngineError> {
        let mut slots = self.slots.lock();
        if slots.started {
            return Err(EngineError::AlreadyStarted);
        }
        slots.started = true;
        for _ in 0..size {
            self.spawn_into(&mut slots)?;
        }
        info!(worker_count = size, "worker pool started");
        Ok(())
    }

    /// Grow or shrink to `new_size` workers. Shrinking retires the
    /// most recently spawned workers once they finish their current job.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotStarted`] or [`EngineError::Spawn`].
    pub fn resize(&self, new_size: usize) -> Result<(), EngineError> {
        let mut slots = self.slots.lock();
        if !slots.started {
            return Err(EngineError::NotStarted);
        }
        slots.reap_retired();
        let current = slots.active.len();
        if new_size > current {
            for _ in current..new_size {
                self.spawn_into(&mut slots)?;
            }
        } else {
            while slots.active.len() > new_size {
                let Some((id, slot)) = slots.active.pop_last() else {
                    break;
                };
                slot.retire.store(true, Ordering::Release);
                if slot.status.get() == WorkerState::Idle {
                    slot.status.set(WorkerState::Draining);
                }
                debug!(worker_id = id, "worker retiring");
                slots.retiring.insert(id, slot);
            }
        }
        info!(from = current, to = new_size, "worker pool resized");
        Ok(())
    }

    /// Workers currently counted toward the pool size.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.slots.lock().active.len()
    }

    /// Workers executing a job right now.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        usize::try_from(self.ctx.counters.active_workers.load()).unwrap_or(usize::MAX)
    }

    /// State of every live worker, including ones still retiring.
    #[must_use]
    pub fn worker_states(&self) -> Vec<(WorkerId, WorkerState)> {
        let slots = self.slots.lock();
        slots
            .active
            .iter()
            .chain(slots.retiring.iter())
            .map(|(id, slot)| (*id, slot.status.get()))
            .collect()
    }

    /// Wait up to `timeout` for every worker to exit. The queue must already
    /// be shut down so workers can observe it. Workers still running when
    /// the timeout elapses are detached and reported, never killed.
    pub fn shutdown(&self, timeout: Duration) -> PoolShutdown {
        let deadline = Instant::now() + timeout;
        let workers: Vec<(WorkerId, WorkerSlot)> = {
            let mut slots = self.slots.lock();
            let mut workers: Vec<_> = std::mem::take(&mut slots.active).into_iter().collect();
            workers.extend(std::mem::take(&mut slots.retiring));
            workers
        };

        let mut waiting: HashSet<WorkerId> = workers
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        while !waiting.is_empty() {
            match self.exits.recv_deadline(deadline) {
                Ok(id) => {
                    waiting.remove(&id);
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut report = PoolShutdown::default();
        for (id, slot) in workers {
            if waiting.contains(&id) {
                let state = slot.status.get();
                warn!(worker_id = id, ?state, "worker did not exit within timeout - detaching");
                report.detached += 1;
                if state == WorkerState::Busy {
                    report.still_busy.push(id);
                }
                continue;
            }
            if slot.handle.join().is_err() {
                warn!(worker_id = id, "worker thread panicked");
            }
            report.stopped += 1;
        }
        info!(
            stopped = report.stopped,
            still_busy = report.still_busy.len(),
            "worker pool shut down"
        );
        report
    }

    fn spawn_into(&self, slots: &mut Slots) -> Result<(), EngineError> {
        let id = slots.next_id;
        slots.next_id += 1;
        let retire = Arc::new(AtomicBool::new(false));
        let status = Arc::new(WorkerStatus::new());
        let handle = worker::spawn(
            id,
            Arc::clone(&self.ctx),
            Arc::clone(&retire),
            Arc::clone(&status),
        )?;
        slots.active.insert(
            id,
            WorkerSlot {
                retire,
                status,
                handle,
            },
        );
        Ok(())
    }
}

impl<P, R, E> fmt::Debug for WorkerPool<P, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("thread_name_prefix", &self.ctx.settings.thread_name_prefix)
            .finish_non_exhaustive()
    }
}
