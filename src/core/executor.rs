//! Job execution trait and per-attempt context.

use async_trait::async_trait;

use super::job::{CancellationToken, JobError, JobId, Priority};

/// Information handed to a job body for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    id: JobId,
    attempt: u32,
    max_attempts: u32,
    priority: Priority,
    worker_id: u64,
    cancellation: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        id: JobId,
        attempt: u32,
        max_attempts: u32,
        priority: Priority,
        worker_id: u64,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            id,
            attempt,
            max_attempts,
            priority,
            worker_id,
            cancellation,
        }
    }

    /// Job being executed.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// 1-based attempt number.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Attempt budget of the job.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether this is the last attempt the retry budget allows.
    #[must_use]
    pub const fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Priority the job was submitted with.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Worker running this attempt.
    #[must_use]
    pub const fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Cooperative cancellation flag. Long-running bodies should poll it.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Shorthand for `self.cancellation().is_cancelled()`.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Executes job payloads on worker threads.
///
/// Each worker thread owns a single-threaded tokio runtime and drives
/// `execute` to completion on it, so CPU-bound bodies never block the
/// caller's async runtime. The payload is borrowed because a failed attempt
/// may be retried with the same payload. Results need not be serializable.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use job_engine::core::{JobContext, JobError, JobExecutor};
///
/// #[derive(Clone)]
/// struct Resize;
///
/// #[async_trait]
/// impl JobExecutor<(u32, u32), u64> for Resize {
///     async fn execute(&self, payload: &(u32, u32), ctx: JobContext) -> Result<u64, JobError> {
///         if ctx.is_cancelled() {
///             return Err(JobError::permanent("cancelled"));
///         }
///         Ok(u64::from(payload.0) * u64::from(payload.1))
///     }
/// }
/// ```
#[async_trait]
pub trait JobExecutor<P, R>: Send + Sync + Clone + 'static
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Run one attempt of a job.
    ///
    /// # Errors
    ///
    /// A [`JobError`] fails the attempt; the retry policy decides what
    /// happens next. Mark it [`JobError::permanent`] to skip retries.
    async fn execute(&self, payload: &P, ctx: JobContext) -> Result<R, JobError>;
}
