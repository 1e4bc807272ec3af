//! Jobs, the priority queue, scheduling, retries and the worker pool.

pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handle;
pub mod job;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod worker_pool;

pub use dead_letter::{
    DeadLetterEntry, DeadLetterSink, InMemoryDeadLetterSink, TracingDeadLetterSink,
};
pub use engine::{Engine, EngineState, HealthReport, ScheduledJob, ShutdownReport};
pub use error::{AppResult, EngineError, SubmitError};
pub use executor::{JobContext, JobExecutor};
pub use handle::{JobHandle, JobOutcome};
pub use job::{
    CancellationToken, FailureRecord, Job, JobError, JobId, JobIdGenerator, JobState, Priority,
};
pub use queue::{DequeueOutcome, EnqueueOutcome, JobQueue};
pub use retry::{ExponentialBackoff, FixedDelay, NoRetry, RetryDecision, RetryPolicy};
pub use scheduler::{PayloadFactory, PeriodicHandle, Scheduler, Trigger};
pub use worker_pool::{CounterSnapshot, PoolShutdown, WorkerId, WorkerPool, WorkerState};
