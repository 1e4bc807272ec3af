//! Bounded priority queue shared by producers and workers.
//!
//! Jobs leave highest [`Priority`](crate::core::Priority) first and, within a
//! priority, in insertion order. There is no aging: a steady stream of
//! high-priority work starves lower tiers indefinitely.
//!
//! Two synchronization axes are kept separate. Free capacity is a
//! [`Semaphore`] acquired *before* the queue mutex, so a producer blocked on a
//! full queue never holds the lock consumers need to make room. The heap,
//! sequence counter and shutdown mode live behind one ranked [`Mutex`] with a
//! [`Condvar`] signalling "not empty".

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::condvar::Condvar;
use crate::core::job::Job;
use crate::mutex::{lock_order, lock_pair, Mutex};
use crate::semaphore::{Acquired, Semaphore, SemaphoreError};

/// Result of [`JobQueue::enqueue`]. Refused jobs are handed back.
#[derive(Debug)]
pub enum EnqueueOutcome<P> {
    /// Space was available on arrival.
    Accepted,
    /// The producer blocked for space, then the job was accepted.
    BlockedThenAccepted,
    /// The queue was full and the caller asked not to block.
    Rejected(Job<P>),
    /// No space appeared before the timeout.
    TimedOut(Job<P>),
    /// The queue no longer accepts work.
    ShuttingDown(Job<P>),
}

impl<P> EnqueueOutcome<P> {
    /// Whether the job is now in the queue.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted | Self::BlockedThenAccepted)
    }
}

/// Result of [`JobQueue::dequeue`].
#[derive(Debug)]
pub enum DequeueOutcome<P> {
    /// The caller now exclusively owns this job.
    Job(Job<P>),
    /// Nothing arrived before the timeout.
    TimedOut,
    /// The queue is shut down and (for drain) empty.
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownMode {
    Drain,
    Discard,
}

/// Wrapper to make a job orderable by priority (highest first) and FIFO within priority.
struct QueuedJob<P>(Job<P>);

impl<P> PartialEq for QueuedJob<P> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P> Eq for QueuedJob<P> {}

impl<P> PartialOrd for QueuedJob<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for QueuedJob<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence (reversed for max-heap)
        self.0
            .priority()
            .cmp(&other.0.priority())
            .then_with(|| other.0.sequence().cmp(&self.0.sequence()))
    }
}

struct QueueState<P> {
    heap: BinaryHeap<QueuedJob<P>>,
    next_seq: u64,
    shutdown: Option<ShutdownMode>,
}

/// Bounded, prioritized multiset of jobs.
pub struct JobQueue<P> {
    capacity: usize,
    slots: Semaphore,
    state: Mutex<QueueState<P>>,
    not_empty: Condvar,
}

impl<P> JobQueue<P> {
    /// Create an empty queue holding at most `capacity` jobs.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Semaphore::new(capacity),
            state: Mutex::ranked(
                lock_order::QUEUE,
                "job_queue",
                QueueState {
                    heap: BinaryHeap::with_capacity(capacity.min(1024)),
                    next_seq: 0,
                    shutdown: None,
                },
            ),
            not_empty: Condvar::new(),
        }
    }

    /// Insert a job. With `block_if_full` the caller waits for space
    /// (released by consumers or by shutdown); otherwise a full queue rejects.
    pub fn enqueue(&self, job: Job<P>, block_if_full: bool) -> EnqueueOutcome<P> {
        if block_if_full {
            match self.slots.acquire() {
                Ok(how) => self.insert(job, how),
                Err(_) => EnqueueOutcome::ShuttingDown(job),
            }
        } else if self.slots.try_acquire() {
            self.insert(job, Acquired::Immediately)
        } else if self.slots.is_closed() {
            EnqueueOutcome::ShuttingDown(job)
        } else {
            EnqueueOutcome::Rejected(job)
        }
    }

    /// Insert a job, waiting at most `timeout` for space.
    pub fn enqueue_timeout(&self, job: Job<P>, timeout: Duration) -> EnqueueOutcome<P> {
        match self.slots.acquire_timeout(timeout) {
            Ok(how) => self.insert(job, how),
            Err(SemaphoreError::TimedOut) => EnqueueOutcome::TimedOut(job),
            Err(SemaphoreError::Closed) => EnqueueOutcome::ShuttingDown(job),
        }
    }

    /// Remove the highest-priority job, waiting up to `timeout` (forever when
    /// `None`) for one to arrive.
    pub fn dequeue(&self, timeout: Option<Duration>) -> DequeueOutcome<P> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(QueuedJob(job)) = state.heap.pop() {
                drop(state);
                self.slots.release();
                return DequeueOutcome::Job(job);
            }
            if state.shutdown.is_some() {
                return DequeueOutcome::ShuttingDown;
            }
            match deadline {
                Some(deadline) => {
                    if self.not_empty.wait_until(&mut state, deadline).timed_out()
                        && state.heap.is_empty()
                        && state.shutdown.is_none()
                    {
                        return DequeueOutcome::TimedOut;
                    }
                }
                None => self.not_empty.wait(&mut state),
            }
        }
    }

    /// Stop accepting work and wake every blocked producer and consumer.
    ///
    /// With `drain`, queued jobs stay for consumers to finish and `dequeue`
    /// reports `ShuttingDown` once the queue is empty. Without it, the queued
    /// jobs are removed and returned (highest priority first) so the caller
    /// can resolve them. Calling it again can upgrade drain to discard.
    pub fn shutdown(&self, drain: bool) -> Vec<Job<P>> {
        let mut state = self.state.lock();
        let discarded = if drain {
            state.shutdown.get_or_insert(ShutdownMode::Drain);
            Vec::new()
        } else {
            state.shutdown = Some(ShutdownMode::Discard);
            let mut jobs: Vec<_> = std::mem::take(&mut state.heap)
                .into_sorted_vec()
                .into_iter()
                .map(|QueuedJob(job)| job)
                .collect();
            jobs.reverse();
            jobs
        };
        drop(state);

        self.slots.close();
        self.not_empty.notify_all();
        debug!(drain, discarded = discarded.len(), "job queue shut down");
        discarded
    }

    /// Move up to `max` jobs (highest priority first) into `other`, limited by
    /// `other`'s free capacity. Target permits are reserved before both queue
    /// locks are taken in global lock order; unused reservations are returned.
    /// Returns how many jobs moved.
    pub fn transfer_to(&self, other: &Self, max: usize) -> usize {
        if std::ptr::eq(self, other) {
            return 0;
        }
        let mut reserved = 0;
        while reserved < max && other.slots.try_acquire() {
            reserved += 1;
        }
        if reserved == 0 {
            return 0;
        }

        let (mut from, mut to) = lock_pair(&self.state, &other.state);
        let mut moved = 0;
        if to.shutdown.is_none() {
            while moved < reserved {
                let Some(QueuedJob(mut job)) = from.heap.pop() else {
                    break;
                };
                let seq = to.next_seq;
                to.next_seq += 1;
                job.mark_queued(seq);
                to.heap.push(QueuedJob(job));
                moved += 1;
            }
        }
        drop(from);
        drop(to);

        for _ in moved..reserved {
            other.slots.release();
        }
        for _ in 0..moved {
            self.slots.release();
        }
        if moved > 0 {
            other.not_empty.notify_all();
        }
        moved
    }

    /// Jobs currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Whether no jobs are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued jobs.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether [`JobQueue::shutdown`] has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown.is_some()
    }

    /// How long the longest-waiting job has been queued. Scans the heap.
    #[must_use]
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .heap
            .iter()
            .map(|QueuedJob(job)| job.enqueued_at())
            .min()
            .map(|oldest| oldest.elapsed())
    }

    fn insert(&self, mut job: Job<P>, how: Acquired) -> EnqueueOutcome<P> {
        let mut state = self.state.lock();
        if state.shutdown.is_some() {
            drop(state);
            self.slots.release();
            return EnqueueOutcome::ShuttingDown(job);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        job.mark_queued(seq);
        state.heap.push(QueuedJob(job));
        drop(state);

        self.not_empty.notify_one();
        match how {
            Acquired::Immediately => EnqueueOutcome::Accepted,
            Acquired::AfterWaiting => EnqueueOutcome::BlockedThenAccepted,
        }
    }
}

impl<P> std::fmt::Debug for JobQueue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("capacity", &self.capacity)
            .field("free", &self.slots.available())
            .finish_non_exhaustive()
    }
}
