//! Delayed and periodic job release.
//!
//! A min-heap of entries keyed by `(due, insertion seq)` is drained by one
//! timer thread. The thread sleeps on a [`Condvar`] until the earliest due
//! instant (or until a new, earlier entry is pushed), moves every due entry
//! to the [`JobQueue`], and re-arms. It never blocks on the queue: a due job
//! that does not fit is kept and retried after `requeue_delay`.
//!
//! Periodic series fire immediately, then every `interval` after each tick.
//! A tick whose previous occurrence has not reached a terminal state is
//! skipped and counted. Worker retries are ordinary one-shot entries.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::condvar::Condvar;
use crate::core::error::EngineError;
use crate::core::job::{CancellationToken, Job, JobId, JobIdGenerator, Occurrence, Priority};
use crate::core::queue::{EnqueueOutcome, JobQueue};
use crate::counter::AtomicCounter;
use crate::mutex::{lock_order, Mutex};
use crate::util::panic_message;

/// Builds the payload for each occurrence of a periodic series.
pub type PayloadFactory<P> = Arc<dyn Fn() -> P + Send + Sync>;

/// When a scheduled job becomes eligible to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Now.
    Immediate,
    /// At a fixed instant; past instants fire immediately.
    At(Instant),
    /// After a delay from now.
    After(Duration),
    /// Now, then repeatedly every interval.
    Every(Duration),
}

/// Tick counters of one periodic series.
#[derive(Debug, Default)]
pub struct SeriesStats {
    fired: AtomicCounter,
    skipped: AtomicCounter,
    stopped: AtomicBool,
}

/// Control handle for a periodic series.
#[derive(Debug, Clone)]
pub struct PeriodicHandle {
    id: JobId,
    cancellation: CancellationToken,
    stats: Arc<SeriesStats>,
}

impl PeriodicHandle {
    /// Series identifier (accepted by `Engine::cancel`).
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Stop future ticks and flag the in-flight occurrence, if any.
    pub fn cancel(&self) -> bool {
        self.cancellation.cancel()
    }

    /// Whether the series was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Whether the series will tick again: neither cancelled nor stopped by
    /// a scheduler shutdown.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_cancelled() && !self.stats.stopped.load(Ordering::Acquire)
    }

    /// Occurrences enqueued so far.
    #[must_use]
    pub fn fired(&self) -> u64 {
        self.stats.fired.load()
    }

    /// Ticks skipped because the previous occurrence was still outstanding
    /// or the queue was full.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.stats.skipped.load()
    }
}

struct Series<P> {
    id: JobId,
    interval: Duration,
    priority: Priority,
    max_attempts: u32,
    factory: PayloadFactory<P>,
    outstanding: Arc<AtomicBool>,
    cancellation: CancellationToken,
    stats: Arc<SeriesStats>,
}

enum EntryKind<P> {
    Once(Job<P>),
    Series(Series<P>),
}

struct Entry<P> {
    due: Instant,
    seq: u64,
    kind: EntryKind<P>,
}

impl<P> PartialEq for Entry<P> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl<P> Eq for Entry<P> {}

impl<P> PartialOrd for Entry<P> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Entry<P> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Earliest due first, then insertion order (reversed for max-heap)
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SchedulerState<P> {
    heap: BinaryHeap<Entry<P>>,
    // live series, including one the timer is firing outside the lock
    series: HashMap<JobId, CancellationToken>,
    next_seq: u64,
    shutdown: bool,
}

impl<P> SchedulerState<P> {
    fn push(&mut self, due: Instant, kind: EntryKind<P>) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;
        let earliest = self.heap.peek().is_none_or(|top| due < top.due);
        self.heap.push(Entry { due, seq, kind });
        earliest
    }
}

/// Timer-driven release of delayed jobs and periodic series into a queue.
pub struct Scheduler<P> {
    state: Mutex<SchedulerState<P>>,
    wake: Condvar,
    timer: Mutex<Option<JoinHandle<()>>>,
    queue: Arc<JobQueue<P>>,
    ids: Arc<JobIdGenerator>,
    requeue_delay: Duration,
    skipped_ticks: AtomicCounter,
}

impl<P: Send + 'static> Scheduler<P> {
    /// Create a scheduler feeding `queue`. Occurrence ids come from `ids`.
    #[must_use]
    pub fn new(queue: Arc<JobQueue<P>>, ids: Arc<JobIdGenerator>, requeue_delay: Duration) -> Self {
        Self {
            state: Mutex::ranked(
                lock_order::SCHEDULER,
                "scheduler",
                SchedulerState {
                    heap: BinaryHeap::new(),
                    series: HashMap::new(),
                    next_seq: 0,
                    shutdown: false,
                },
            ),
            wake: Condvar::new(),
            timer: Mutex::ranked(lock_order::SCHEDULER, "scheduler_timer", None),
            queue,
            ids,
            requeue_delay,
            skipped_ticks: AtomicCounter::new(0),
        }
    }

    /// Spawn the timer thread. Entries pushed before this call are kept and
    /// released once it runs.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyStarted`], [`EngineError::ShuttingDown`] or
    /// [`EngineError::Spawn`].
    pub fn start(self: &Arc<Self>, thread_name: &str) -> Result<(), EngineError> {
        if self.is_shutdown() {
            return Err(EngineError::ShuttingDown);
        }
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(thread_name.to_owned())
            .spawn(move || this.run())
            .map_err(|source| EngineError::Spawn {
                name: thread_name.to_owned(),
                source,
            })?;
        *timer = Some(handle);
        debug!(thread = thread_name, "scheduler timer started");
        Ok(())
    }

    /// Release `job` into the queue at `due`. The job is handed back if the
    /// scheduler is shut down.
    ///
    /// # Errors
    ///
    /// Returns the job when the scheduler no longer accepts entries.
    pub fn schedule_once(&self, job: Job<P>, due: Instant) -> Result<(), Job<P>> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(job);
        }
        trace!(job_id = %job.id(), "job scheduled");
        if state.push(due, EntryKind::Once(job)) {
            drop(state);
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Start a periodic series. The first occurrence fires immediately.
    ///
    /// # Errors
    ///
    /// [`EngineError::ShuttingDown`] when the scheduler is shut down.
    pub fn schedule_series(
        &self,
        id: JobId,
        interval: Duration,
        priority: Priority,
        max_attempts: u32,
        factory: PayloadFactory<P>,
    ) -> Result<PeriodicHandle, EngineError> {
        let cancellation = CancellationToken::new();
        let stats = Arc::new(SeriesStats::default());
        let series = Series {
            id,
            interval: interval.max(Duration::from_millis(1)),
            priority,
            max_attempts,
            factory,
            outstanding: Arc::new(AtomicBool::new(false)),
            cancellation: cancellation.clone(),
            stats: Arc::clone(&stats),
        };

        let mut state = self.state.lock();
        if state.shutdown {
            return Err(EngineError::ShuttingDown);
        }
        state.series.insert(id, cancellation.clone());
        state.push(Instant::now(), EntryKind::Series(series));
        drop(state);
        self.wake.notify_one();

        debug!(series_id = %id, interval_ms = interval.as_millis(), "periodic series scheduled");
        Ok(PeriodicHandle {
            id,
            cancellation,
            stats,
        })
    }

    /// Cancel a periodic series by id and remove it from the timer heap.
    pub fn cancel_series(&self, id: JobId) -> bool {
        let mut state = self.state.lock();
        let Some(cancellation) = state.series.remove(&id) else {
            return false;
        };
        cancellation.cancel();
        state
            .heap
            .retain(|entry| !matches!(&entry.kind, EntryKind::Series(series) if series.id == id));
        true
    }

    /// Entries waiting for their due time.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Periodic ticks skipped across every series.
    #[must_use]
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load()
    }

    /// Whether [`Scheduler::shutdown`] has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Stop the timer, stop every series and return the one-shot jobs that
    /// were never released. Subsequent calls return nothing.
    pub fn shutdown(&self) -> Vec<Job<P>> {
        self.state.lock().shutdown = true;
        self.wake.notify_all();

        let timer = self.timer.lock().take();
        if let Some(handle) = timer {
            if handle.join().is_err() {
                warn!("scheduler timer thread panicked");
            }
        }

        let entries = {
            let mut state = self.state.lock();
            state.series.clear();
            std::mem::take(&mut state.heap)
        };
        // Series stop ticking but keep their tokens: occurrences already in
        // the queue share them and still run under a drain.
        let mut jobs = Vec::new();
        for entry in entries.into_sorted_vec().into_iter().rev() {
            match entry.kind {
                EntryKind::Once(job) => jobs.push(job),
                EntryKind::Series(series) => series.stats.stopped.store(true, Ordering::Release),
            }
        }
        debug!(undelivered = jobs.len(), "scheduler shut down");
        jobs
    }

    fn run(&self) {
        loop {
            let due = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    match state.heap.peek().map(|top| top.due) {
                        None => self.wake.wait(&mut state),
                        Some(due) if due > Instant::now() => {
                            let _ = self.wake.wait_until(&mut state, due);
                        }
                        Some(_) => break,
                    }
                }
                let now = Instant::now();
                let mut batch = Vec::new();
                while state.heap.peek().is_some_and(|top| top.due <= now) {
                    if let Some(entry) = state.heap.pop() {
                        batch.push(entry);
                    }
                }
                batch
            };

            let mut rearm = Vec::new();
            for entry in due {
                if let Some(next) = self.fire(entry.kind) {
                    rearm.push(next);
                }
            }
            if !rearm.is_empty() {
                // kept even after shutdown so `shutdown` can hand them back
                let mut state = self.state.lock();
                for (due, kind) in rearm {
                    state.push(due, kind);
                }
            }
        }
    }

    fn fire(&self, kind: EntryKind<P>) -> Option<(Instant, EntryKind<P>)> {
        match kind {
            EntryKind::Once(job) => match self.queue.enqueue(job, false) {
                EnqueueOutcome::Accepted | EnqueueOutcome::BlockedThenAccepted => None,
                EnqueueOutcome::Rejected(job)
                | EnqueueOutcome::TimedOut(job)
                | EnqueueOutcome::ShuttingDown(job) => {
                    debug!(
                        job_id = %job.id(),
                        delay_ms = self.requeue_delay.as_millis(),
                        "queue refused due job, re-arming"
                    );
                    Some((Instant::now() + self.requeue_delay, EntryKind::Once(job)))
                }
            },
            EntryKind::Series(series) => {
                if series.cancellation.is_cancelled() {
                    self.state.lock().series.remove(&series.id);
                    debug!(series_id = %series.id, "periodic series cancelled");
                    return None;
                }
                self.tick(&series);
                Some((Instant::now() + series.interval, EntryKind::Series(series)))
            }
        }
    }

    fn tick(&self, series: &Series<P>) {
        if series.outstanding.load(Ordering::Acquire) {
            series.stats.skipped.increment();
            self.skipped_ticks.increment();
            debug!(series_id = %series.id, "previous occurrence still running, tick skipped");
            return;
        }

        // a factory panic costs one tick, never the timer thread
        let payload = match catch_unwind(AssertUnwindSafe(|| (series.factory)())) {
            Ok(payload) => payload,
            Err(panic) => {
                series.stats.skipped.increment();
                self.skipped_ticks.increment();
                warn!(
                    series_id = %series.id,
                    panic = %panic_message(panic.as_ref()),
                    "payload factory panicked, tick skipped"
                );
                return;
            }
        };

        let job = Job::new(self.ids.next_id(), payload, series.priority, series.max_attempts)
            .with_cancellation(series.cancellation.clone())
            .with_occurrence(Occurrence::new(series.id, Arc::clone(&series.outstanding)));
        let job_id = job.id();

        if self.queue.enqueue(job, false).is_accepted() {
            series.stats.fired.increment();
            trace!(series_id = %series.id, job_id = %job_id, "occurrence enqueued");
        } else {
            // the refused job was dropped, which already cleared `outstanding`
            series.stats.skipped.increment();
            self.skipped_ticks.increment();
            debug!(series_id = %series.id, "queue refused occurrence, tick skipped");
        }
    }
}

impl<P> fmt::Debug for Scheduler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("requeue_delay", &self.requeue_delay)
            .field("skipped_ticks", &self.skipped_ticks.load())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::DequeueOutcome;

    fn setup(capacity: usize) -> (Arc<JobQueue<u64>>, Arc<Scheduler<u64>>, Arc<JobIdGenerator>) {
        let queue = Arc::new(JobQueue::new(capacity));
        let ids = Arc::new(JobIdGenerator::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&ids),
            Duration::from_millis(5),
        ));
        (queue, scheduler, ids)
    }

    fn job(ids: &JobIdGenerator, payload: u64) -> Job<u64> {
        Job::new(ids.next_id(), payload, Priority::NORMAL, 1)
    }

    fn take(queue: &JobQueue<u64>, timeout: Duration) -> Option<Job<u64>> {
        match queue.dequeue(Some(timeout)) {
            DequeueOutcome::Job(job) => Some(job),
            _ => None,
        }
    }

    #[test]
    fn test_releases_in_due_order() {
        let (queue, scheduler, ids) = setup(8);
        let now = Instant::now();
        scheduler.schedule_once(job(&ids, 2), now + Duration::from_millis(40)).unwrap();
        scheduler.schedule_once(job(&ids, 1), now + Duration::from_millis(10)).unwrap();
        scheduler.start("test-timer").unwrap();

        let first = take(&queue, Duration::from_secs(2)).unwrap();
        let second = take(&queue, Duration::from_secs(2)).unwrap();
        assert_eq!(*first.payload(), 1);
        assert_eq!(*second.payload(), 2);
        assert!(now.elapsed() >= Duration::from_millis(40));
        scheduler.shutdown();
    }

    #[test]
    fn test_full_queue_rearms_instead_of_dropping() {
        let (queue, scheduler, ids) = setup(1);
        queue.enqueue(job(&ids, 0), false);
        scheduler.schedule_once(job(&ids, 1), Instant::now()).unwrap();
        scheduler.start("test-timer").unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.len(), 1);

        assert_eq!(*take(&queue, Duration::ZERO).unwrap().payload(), 0);
        let released = take(&queue, Duration::from_secs(2)).unwrap();
        assert_eq!(*released.payload(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_returns_undelivered() {
        let (_queue, scheduler, ids) = setup(4);
        scheduler.start("test-timer").unwrap();
        scheduler
            .schedule_once(job(&ids, 1), Instant::now() + Duration::from_secs(60))
            .unwrap();

        let leftovers = scheduler.shutdown();
        assert_eq!(leftovers.len(), 1);
        assert!(scheduler.shutdown().is_empty());
        assert!(scheduler.schedule_once(job(&ids, 2), Instant::now()).is_err());
    }

    #[test]
    fn test_series_skips_while_occurrence_outstanding() {
        let (queue, scheduler, ids) = setup(8);
        scheduler.start("test-timer").unwrap();
        let handle = scheduler
            .schedule_series(
                ids.next_id(),
                Duration::from_millis(10),
                Priority::NORMAL,
                1,
                Arc::new(|| 7),
            )
            .unwrap();

        // hold the first occurrence so later ticks see it outstanding
        let held = take(&queue, Duration::from_secs(2)).unwrap();
        assert_eq!(held.series(), Some(handle.id()));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.fired(), 1);
        assert!(handle.skipped() >= 2);
        assert!(queue.is_empty());

        drop(held);
        let next = take(&queue, Duration::from_secs(2)).unwrap();
        assert_eq!(*next.payload(), 7);
        assert_eq!(next.series(), Some(handle.id()));
        scheduler.shutdown();
    }

    #[test]
    fn test_cancel_series() {
        let (queue, scheduler, ids) = setup(8);
        let handle = scheduler
            .schedule_series(
                ids.next_id(),
                Duration::from_secs(60),
                Priority::NORMAL,
                1,
                Arc::new(|| 1),
            )
            .unwrap();
        assert!(scheduler.cancel_series(handle.id()));
        assert!(handle.is_cancelled());
        assert_eq!(scheduler.pending(), 0);
        assert!(!scheduler.cancel_series(handle.id()));

        scheduler.start("test-timer").unwrap();
        assert!(take(&queue, Duration::from_millis(30)).is_none());
        scheduler.shutdown();
    }

    #[test]
    fn test_factory_panic_skips_tick() {
        let (queue, scheduler, ids) = setup(8);
        scheduler.start("test-timer").unwrap();
        let handle = scheduler
            .schedule_series(
                ids.next_id(),
                Duration::from_secs(60),
                Priority::NORMAL,
                1,
                Arc::new(|| -> u64 { panic!("no payload") }),
            )
            .unwrap();
        scheduler
            .schedule_once(job(&ids, 4), Instant::now() + Duration::from_millis(10))
            .unwrap();

        // the timer thread survived the first tick
        let released = take(&queue, Duration::from_secs(2)).unwrap();
        assert_eq!(*released.payload(), 4);
        assert_eq!(handle.skipped(), 1);
        assert_eq!(handle.fired(), 0);
        assert!(handle.is_active());
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_stops_series_without_cancelling_occurrences() {
        let (queue, scheduler, ids) = setup(8);
        scheduler.start("test-timer").unwrap();
        let handle = scheduler
            .schedule_series(
                ids.next_id(),
                Duration::from_secs(60),
                Priority::NORMAL,
                1,
                Arc::new(|| 3),
            )
            .unwrap();
        let queued = take(&queue, Duration::from_secs(2)).unwrap();

        assert!(scheduler.shutdown().is_empty());
        assert!(!handle.is_active());
        assert!(!handle.is_cancelled());
        assert!(!queued.is_cancelled());
    }
}
