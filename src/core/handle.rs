//! Result delivery: one-shot outcome channels and the registry of
//! outstanding jobs.
//!
//! Every submitted job gets a bounded(1) crossbeam channel. The sending half
//! lives in the [`Registry`] until a worker (or shutdown) resolves the job;
//! removing the entry and sending happen together, so each job is resolved
//! exactly once. The receiving half is the submitter's [`JobHandle`].

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::trace;

use crate::core::error::EngineError;
use crate::core::job::{CancellationToken, FailureRecord, JobError, JobId};
use crate::mutex::{lock_order, Mutex};

/// Final result of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome<R> {
    /// The body returned a value.
    Completed(R),
    /// The engine gave up on the job without running it (shutdown).
    Failed(JobError),
    /// Retries were exhausted; carries the full failure history.
    DeadLettered(Vec<FailureRecord>),
    /// Cancelled before it ran.
    Cancelled,
}

impl<R> JobOutcome<R> {
    /// Value of a completed job.
    pub fn completed(self) -> Option<R> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the job completed successfully.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Short label used in logs and health output.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::DeadLettered(_) => "dead_lettered",
            Self::Cancelled => "cancelled",
        }
    }
}

struct Tracked<R> {
    cancellation: CancellationToken,
    tx: Sender<JobOutcome<R>>,
}

/// Outstanding one-shot jobs, keyed by id.
pub(crate) struct Registry<R> {
    entries: Mutex<HashMap<JobId, Tracked<R>>>,
}

impl<R> Registry<R> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::ranked(lock_order::REGISTRY, "job_registry", HashMap::new()),
        }
    }

    /// Track a one-shot job and return the receiving half of its outcome channel.
    pub(crate) fn register(
        &self,
        id: JobId,
        cancellation: CancellationToken,
    ) -> Receiver<JobOutcome<R>> {
        let (tx, rx) = bounded(1);
        self.entries.lock().insert(id, Tracked { cancellation, tx });
        rx
    }

    /// Deliver `outcome` and forget the job. Returns `false` if it was already
    /// resolved (or never tracked).
    pub(crate) fn resolve(&self, id: JobId, outcome: JobOutcome<R>) -> bool {
        let tracked = self.entries.lock().remove(&id);
        let Some(Tracked { tx, .. }) = tracked else {
            return false;
        };
        trace!(job_id = %id, outcome = outcome.label(), "job resolved");
        // the handle may already be gone; that is not an error
        let _ = tx.try_send(outcome);
        true
    }

    /// Flag the job as cancelled. The entry stays until the job's current
    /// owner resolves it.
    pub(crate) fn cancel(&self, id: JobId) -> bool {
        match self.entries.lock().get(&id) {
            Some(tracked) => {
                tracked.cancellation.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a job that was never admitted, without resolving it.
    pub(crate) fn forget(&self, id: JobId) {
        self.entries.lock().remove(&id);
    }

    /// Jobs still awaiting resolution.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Submitter's side of a job: wait for its outcome or cancel it.
#[derive(Debug)]
pub struct JobHandle<R> {
    id: JobId,
    cancellation: CancellationToken,
    rx: Receiver<JobOutcome<R>>,
}

impl<R> JobHandle<R> {
    pub(crate) const fn new(
        id: JobId,
        cancellation: CancellationToken,
        rx: Receiver<JobOutcome<R>>,
    ) -> Self {
        Self { id, cancellation, rx }
    }

    /// Job identifier.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Request cancellation. A queued job resolves `Cancelled`; a running body
    /// sees the flag through its [`JobContext`](crate::core::JobContext).
    pub fn cancel(&self) -> bool {
        self.cancellation.cancel()
    }

    /// Block until the job is resolved.
    ///
    /// # Errors
    ///
    /// [`EngineError::Disconnected`] if the engine dropped the job without
    /// resolving it (engine dropped without shutdown).
    pub fn wait(self) -> Result<JobOutcome<R>, EngineError> {
        self.rx.recv().map_err(|_| EngineError::Disconnected)
    }

    /// Block at most `timeout` for the outcome. The outcome is delivered once;
    /// after a successful call further calls report `Disconnected`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Timeout`] or [`EngineError::Disconnected`].
    pub fn wait_timeout(&self, timeout: Duration) -> Result<JobOutcome<R>, EngineError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => EngineError::Timeout,
            RecvTimeoutError::Disconnected => EngineError::Disconnected,
        })
    }

    /// Take the outcome if it is already available.
    pub fn try_outcome(&self) -> Option<JobOutcome<R>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

impl<R: Send + 'static> JobHandle<R> {
    /// Await the outcome from async code.
    ///
    /// The blocking receive runs on tokio's blocking thread pool so the
    /// caller's runtime is never stalled.
    ///
    /// # Errors
    ///
    /// [`EngineError::Timeout`] or [`EngineError::Disconnected`].
    pub async fn wait_async(self, timeout: Option<Duration>) -> Result<JobOutcome<R>, EngineError> {
        let rx = self.rx;
        tokio::task::spawn_blocking(move || match timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => EngineError::Timeout,
                RecvTimeoutError::Disconnected => EngineError::Disconnected,
            }),
            None => rx.recv().map_err(|_| EngineError::Disconnected),
        })
        .await
        .map_err(|_| EngineError::Disconnected)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn tracked(registry: &Registry<u32>, seq: u64) -> JobHandle<u32> {
        let id = JobId::from_parts(0, seq);
        let token = CancellationToken::new();
        let rx = registry.register(id, token.clone());
        JobHandle::new(id, token, rx)
    }

    #[test]
    fn test_resolve_exactly_once() {
        let registry = Registry::new();
        let handle = tracked(&registry, 1);

        assert!(registry.resolve(handle.id(), JobOutcome::Completed(7)));
        assert!(!registry.resolve(handle.id(), JobOutcome::Completed(8)));
        assert_eq!(registry.len(), 0);
        assert_eq!(handle.wait().unwrap(), JobOutcome::Completed(7));
    }

    #[test]
    fn test_wait_timeout_then_resolve_from_other_thread() {
        let registry = Arc::new(Registry::new());
        let handle = tracked(&registry, 1);
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(5)),
            Err(EngineError::Timeout)
        ));

        let id = handle.id();
        let resolver = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.resolve(id, JobOutcome::Cancelled))
        };
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(5)).unwrap(),
            JobOutcome::Cancelled
        );
        assert!(resolver.join().unwrap());
    }

    #[test]
    fn test_dropped_registry_disconnects() {
        let registry = Registry::new();
        let handle = tracked(&registry, 1);
        drop(registry);
        assert!(matches!(handle.wait(), Err(EngineError::Disconnected)));
    }

    #[test]
    fn test_cancel_marks_token() {
        let registry: Registry<u32> = Registry::new();
        let handle = tracked(&registry, 1);
        assert!(registry.cancel(handle.id()));
        assert!(handle.cancellation.is_cancelled());
        // entries stay until resolved
        assert_eq!(registry.len(), 1);
        assert!(!registry.cancel(JobId::from_parts(0, 99)));

        registry.forget(handle.id());
        assert_eq!(registry.len(), 0);
        assert!(matches!(handle.wait(), Err(EngineError::Disconnected)));
    }

    #[test]
    fn test_try_outcome() {
        let registry = Registry::new();
        let handle = tracked(&registry, 1);
        assert!(handle.try_outcome().is_none());
        registry.resolve(handle.id(), JobOutcome::Completed(1));
        assert_eq!(handle.try_outcome(), Some(JobOutcome::Completed(1)));
    }

    #[tokio::test]
    async fn test_wait_async() {
        let registry = Arc::new(Registry::new());
        let handle = tracked(&registry, 1);
        let id = handle.id();
        let resolver = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                registry.resolve(id, JobOutcome::Completed(42))
            })
        };
        let outcome = handle.wait_async(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(outcome.completed(), Some(42));
        assert!(resolver.join().unwrap());
    }
}
