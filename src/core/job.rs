//! Job data model: ids, priorities, lifecycle state and failure history.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::counter::AtomicCounter;
use crate::util::clock::now_ms;

static GENERATIONS: AtomicCounter = AtomicCounter::new(0);

/// Generation-stamped job identifier.
///
/// `generation` distinguishes engine instances within a process; `seq` is
/// assigned monotonically by that engine's [`JobIdGenerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId {
    generation: u32,
    seq: u64,
}

impl JobId {
    /// Build an id from its parts.
    #[must_use]
    pub const fn from_parts(generation: u32, seq: u64) -> Self {
        Self { generation, seq }
    }

    /// Engine generation that issued this id.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Sequence number within the generation.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}-{}", self.generation, self.seq)
    }
}

/// Issues [`JobId`]s for one engine instance.
#[derive(Debug)]
pub struct JobIdGenerator {
    generation: u32,
    next: AtomicCounter,
}

impl JobIdGenerator {
    /// Create a generator stamped with a fresh process-wide generation.
    #[must_use]
    pub fn new() -> Self {
        let generation = u32::try_from(GENERATIONS.increment()).unwrap_or(u32::MAX);
        Self {
            generation,
            next: AtomicCounter::new(0),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> JobId {
        JobId::from_parts(self.generation, self.next.increment())
    }

    /// Generation stamped on every id from this generator.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl Default for JobIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Job priority; higher values run first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Background work.
    pub const LOW: Self = Self(-10);
    /// Default tier.
    pub const NORMAL: Self = Self(0);
    /// Latency-sensitive work.
    pub const HIGH: Self = Self(10);
    /// Runs ahead of everything else.
    pub const CRITICAL: Self = Self(100);
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a job.
///
/// `Created → Queued → InFlight → {Completed | Failed}`; a `Failed` job goes
/// back to `Queued` while attempts remain, otherwise to `DeadLettered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Built but not yet handed to the queue or scheduler.
    Created,
    /// Waiting in the queue or for its retry/due time.
    Queued,
    /// Owned by a worker that is executing it.
    InFlight,
    /// Finished successfully.
    Completed,
    /// Last attempt failed; retry decision pending, or abandoned at shutdown.
    Failed,
    /// Retries exhausted; handed to the dead-letter sink.
    DeadLettered,
    /// Cancelled before execution.
    Cancelled,
}

impl JobState {
    /// Whether no further transition can happen whatever the engine decides
    /// next.
    ///
    /// `Failed` is excluded: on the retry path it precedes either `Queued`
    /// or `DeadLettered`. A job that shutdown resolves as `Failed` is final
    /// because its handle has been resolved with [`JobOutcome::Failed`], not
    /// because of its state.
    ///
    /// [`JobOutcome::Failed`]: crate::core::JobOutcome::Failed
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered | Self::Cancelled)
    }
}

/// Shared cancellation flag handed to job bodies.
///
/// The engine guarantees visibility of the flag, never preemption: a running
/// body must poll [`CancellationToken::is_cancelled`] to stop early.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// New, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `false` if it was already requested.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Error returned by a job body.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct JobError {
    message: String,
    permanent: bool,
}

impl JobError {
    /// A transient failure; the retry policy decides whether to try again.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    /// A failure that retrying cannot fix; the job is abandoned immediately.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the error was marked non-retryable.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.permanent
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// One failed attempt in a job's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Attempt number (1-based) that failed.
    pub attempt: u32,
    /// Error reported by the body.
    pub error: JobError,
    /// Wall-clock time of the failure, ms since epoch.
    pub at_ms: u128,
}

/// Marks one occurrence of a periodic series as outstanding until the job is
/// dropped, which happens exactly when it reaches a terminal state.
#[derive(Debug)]
pub(crate) struct Occurrence {
    series: JobId,
    outstanding: Arc<AtomicBool>,
}

impl Occurrence {
    pub(crate) fn new(series: JobId, outstanding: Arc<AtomicBool>) -> Self {
        outstanding.store(true, Ordering::Release);
        Self {
            series,
            outstanding,
        }
    }
}

impl Drop for Occurrence {
    fn drop(&mut self) {
        self.outstanding.store(false, Ordering::Release);
    }
}

/// A unit of work.
///
/// Only the attempt count, state and failure history change after creation,
/// and only through the component that currently owns the job (the queue,
/// the scheduler or a worker). Ownership moves with the value.
pub struct Job<P> {
    id: JobId,
    priority: Priority,
    payload: P,
    created_at_ms: u128,
    enqueued_at: Instant,
    seq: u64,
    attempts: u32,
    max_attempts: u32,
    state: JobState,
    failures: Vec<FailureRecord>,
    cancellation: CancellationToken,
    occurrence: Option<Occurrence>,
}

impl<P> Job<P> {
    /// Create a job. `max_attempts` is clamped to at least one.
    pub fn new(id: JobId, payload: P, priority: Priority, max_attempts: u32) -> Self {
        Self {
            id,
            priority,
            payload,
            created_at_ms: now_ms(),
            enqueued_at: Instant::now(),
            seq: 0,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            state: JobState::Created,
            failures: Vec::new(),
            cancellation: CancellationToken::new(),
            occurrence: None,
        }
    }

    /// Use `token` as this job's cancellation flag.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub(crate) fn with_occurrence(mut self, occurrence: Occurrence) -> Self {
        self.occurrence = Some(occurrence);
        self
    }

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Priority tier.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Opaque payload.
    #[must_use]
    pub const fn payload(&self) -> &P {
        &self.payload
    }

    /// Consume the job and return its payload.
    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Attempts made so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    /// Every failed attempt so far, oldest first.
    #[must_use]
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    /// Cancellation flag shared with the submitter.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Creation time, ms since epoch.
    #[must_use]
    pub const fn created_at_ms(&self) -> u128 {
        self.created_at_ms
    }

    /// When the job last entered a queue.
    #[must_use]
    pub const fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Time since the job last entered a queue.
    #[must_use]
    pub fn queued_for(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Insertion sequence within the queue (FIFO tie-break).
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.seq
    }

    /// Periodic series this job is an occurrence of, if any.
    #[must_use]
    pub fn series(&self) -> Option<JobId> {
        self.occurrence.as_ref().map(|o| o.series)
    }

    pub(crate) fn mark_queued(&mut self, seq: u64) {
        self.seq = seq;
        self.enqueued_at = Instant::now();
        self.state = JobState::Queued;
    }

    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.state = JobState::InFlight;
        self.attempts
    }

    pub(crate) fn record_failure(&mut self, error: JobError) {
        self.failures.push(FailureRecord {
            attempt: self.attempts,
            error,
            at_ms: now_ms(),
        });
        self.state = JobState::Failed;
    }

    pub(crate) fn set_state(&mut self, state: JobState) {
        self.state = state;
    }
}

impl<P> fmt::Debug for Job<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .field("series", &self.series())
            .finish_non_exhaustive()
    }
}
