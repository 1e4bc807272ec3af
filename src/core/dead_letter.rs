//! Dead-letter sink implementations.
//!
//! Jobs whose retries are exhausted (or that fail permanently) are recorded
//! here with their full failure history before the submitter's handle is
//! resolved.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::core::job::{FailureRecord, Job, JobId, Priority};
use crate::mutex::{lock_order, Mutex};
use crate::util::clock::now_ms;

/// Destination for abandoned jobs.
pub trait DeadLetterSink<P>: Send + Sync {
    /// Record an abandoned job. Called from worker threads and during
    /// shutdown, never while an engine lock is held.
    fn record(&self, job: &Job<P>, history: &[FailureRecord]);
}

/// One dead-lettered job.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry<P> {
    /// Unique entry identifier.
    pub entry_id: String,
    /// Abandoned job.
    pub job_id: JobId,
    /// Priority it was submitted with.
    pub priority: Priority,
    /// Attempts made.
    pub attempts: u32,
    /// Copy of the payload.
    pub payload: P,
    /// Every failed attempt, oldest first.
    pub failures: Vec<FailureRecord>,
    /// Timestamp milliseconds.
    pub recorded_at_ms: u128,
}

/// In-memory dead-letter sink for testing and dev.
pub struct InMemoryDeadLetterSink<P> {
    entries: Mutex<VecDeque<DeadLetterEntry<P>>>,
    max_entries: usize,
}

impl<P> InMemoryDeadLetterSink<P> {
    /// Create a new in-memory sink with a bounded buffer; the oldest entry
    /// is evicted when full.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::ranked(
                lock_order::SINK,
                "dead_letter_sink",
                VecDeque::with_capacity(max_entries.min(1024)),
            ),
            max_entries,
        }
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every stored entry.
    pub fn take(&self) -> Vec<DeadLetterEntry<P>> {
        self.entries.lock().drain(..).collect()
    }
}

impl<P: Clone> InMemoryDeadLetterSink<P> {
    /// Retrieve a snapshot of stored entries.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetterEntry<P>> {
        self.entries.lock().iter().cloned().collect()
    }
}

impl<P: Clone + Send> DeadLetterSink<P> for InMemoryDeadLetterSink<P> {
    fn record(&self, job: &Job<P>, history: &[FailureRecord]) {
        let entry = DeadLetterEntry {
            entry_id: Uuid::new_v4().to_string(),
            job_id: job.id(),
            priority: job.priority(),
            attempts: job.attempts(),
            payload: job.payload().clone(),
            failures: history.to_vec(),
            recorded_at_ms: now_ms(),
        };
        let mut entries = self.entries.lock();
        if self.max_entries == 0 {
            return;
        }
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Sink that only emits a structured `warn` event per abandoned job.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDeadLetterSink;

impl<P> DeadLetterSink<P> for TracingDeadLetterSink {
    fn record(&self, job: &Job<P>, history: &[FailureRecord]) {
        let last_error = history.last().map_or("", |r| r.error.message());
        warn!(
            job_id = %job.id(),
            attempts = job.attempts(),
            failures = history.len(),
            last_error,
            "job dead-lettered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobError;

    fn failed_job(seq: u64) -> Job<String> {
        let id = JobId::from_parts(0, seq);
        let mut job = Job::new(id, format!("job-{seq}"), Priority::NORMAL, 2);
        job.begin_attempt();
        job.record_failure(JobError::new("first"));
        job.begin_attempt();
        job.record_failure(JobError::new("second"));
        job
    }

    #[test]
    fn test_records_full_history() {
        let sink = InMemoryDeadLetterSink::new(10);
        let job = failed_job(1);
        sink.record(&job, job.failures());

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, job.id());
        assert_eq!(entries[0].attempts, 2);
        assert_eq!(entries[0].payload, "job-1");
        assert_eq!(entries[0].failures.len(), 2);
        assert_eq!(entries[0].failures[1].error.message(), "second");
        assert!(Uuid::parse_str(&entries[0].entry_id).is_ok());
    }

    #[test]
    fn test_bounded_buffer_evicts_oldest() {
        let sink = InMemoryDeadLetterSink::new(2);
        for seq in 1..=3 {
            let job = failed_job(seq);
            sink.record(&job, job.failures());
        }
        let ids: Vec<_> = sink.take().into_iter().map(|e| e.job_id.seq()).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_tracing_sink_accepts_any_payload() {
        let job = failed_job(1);
        DeadLetterSink::record(&TracingDeadLetterSink, &job, job.failures());
    }
}
