//! Worker thread loop: dequeue, execute unlocked, report.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tokio::runtime::Runtime;
use tracing::{debug, error, trace, warn};

use crate::core::error::EngineError;
use crate::core::executor::{JobContext, JobExecutor};
use crate::core::handle::JobOutcome;
use crate::core::job::{Job, JobError, JobState};
use crate::core::queue::DequeueOutcome;
use crate::core::retry::RetryDecision;
use crate::util::panic_message;

use super::{PoolContext, WorkerId, WorkerState, WorkerStatus};

/// Marks the worker stopped and notifies the pool when the thread exits,
/// including by unwinding.
struct ExitNotice<P, R, E> {
    id: WorkerId,
    status: Arc<WorkerStatus>,
    ctx: Arc<PoolContext<P, R, E>>,
}

impl<P, R, E> Drop for ExitNotice<P, R, E> {
    fn drop(&mut self) {
        self.status.set(WorkerState::Stopped);
        let _ = self.ctx.exits.send(self.id);
        debug!(worker_id = self.id, "worker thread exiting");
    }
}

fn build_runtime(worker_id: WorkerId) -> Option<Runtime> {
    match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => Some(rt),
        Err(e) => {
            error!(worker_id, error = %e, "failed to create worker runtime");
            None
        }
    }
}

/// Spawn a worker thread.
pub(super) fn spawn<P, R, E>(
    id: WorkerId,
    ctx: Arc<PoolContext<P, R, E>>,
    retire: Arc<AtomicBool>,
    status: Arc<WorkerStatus>,
) -> Result<JoinHandle<()>, EngineError>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    let name = format!("{}-{id}", ctx.settings.thread_name_prefix);
    let mut builder = thread::Builder::new().name(name.clone());
    if let Some(stack_size) = ctx.settings.stack_size {
        builder = builder.stack_size(stack_size);
    }
    builder
        .spawn(move || run(id, ctx, &retire, status))
        .map_err(|source| EngineError::Spawn { name, source })
}

fn run<P, R, E>(
    id: WorkerId,
    ctx: Arc<PoolContext<P, R, E>>,
    retire: &AtomicBool,
    status: Arc<WorkerStatus>,
) where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    let _exit = ExitNotice {
        id,
        status: Arc::clone(&status),
        ctx: Arc::clone(&ctx),
    };
    debug!(worker_id = id, "worker thread started");

    // Each worker has its own single-threaded tokio runtime
    let Some(mut rt) = build_runtime(id) else {
        return;
    };

    loop {
        if retire.load(Ordering::Acquire) {
            status.set(WorkerState::Draining);
            debug!(worker_id = id, "worker retired");
            break;
        }
        status.set(WorkerState::Idle);

        // bounded wait so the retire flag is observed while idle
        let job = match ctx.queue.dequeue(Some(ctx.settings.idle_poll)) {
            DequeueOutcome::Job(job) => job,
            DequeueOutcome::TimedOut => continue,
            DequeueOutcome::ShuttingDown => {
                debug!(worker_id = id, "queue shut down, worker exiting");
                break;
            }
        };

        if job.is_cancelled() {
            ctx.cancel(job);
            continue;
        }

        status.set(WorkerState::Busy);
        let healthy = execute(id, &ctx, &rt, job);
        if !healthy {
            // a panicking body may leave tasks behind on the runtime
            match build_runtime(id) {
                Some(fresh) => rt = fresh,
                None => break,
            }
        }
    }
}

/// Run one attempt and route the result. Returns `false` if the body panicked.
fn execute<P, R, E>(
    id: WorkerId,
    ctx: &PoolContext<P, R, E>,
    rt: &Runtime,
    mut job: Job<P>,
) -> bool
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    let attempt = job.begin_attempt();
    let job_id = job.id();
    let job_ctx = JobContext::new(
        job_id,
        attempt,
        job.max_attempts(),
        job.priority(),
        id,
        job.cancellation().clone(),
    );
    debug!(worker_id = id, job_id = %job_id, attempt, "worker executing job");

    ctx.counters.active_workers.increment();
    let started = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| {
        rt.block_on(ctx.executor.execute(job.payload(), job_ctx))
    }));
    ctx.counters.active_workers.decrement();
    let elapsed_ms = started.elapsed().as_millis();

    match result {
        Ok(Ok(value)) => {
            job.set_state(JobState::Completed);
            ctx.counters.completed.increment();
            trace!(worker_id = id, job_id = %job_id, elapsed_ms, "job completed");
            ctx.registry.resolve(job_id, JobOutcome::Completed(value));
            true
        }
        Ok(Err(err)) => {
            debug!(
                worker_id = id,
                job_id = %job_id,
                attempt,
                error = %err,
                elapsed_ms,
                "job failed"
            );
            fail(ctx, job, err);
            true
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(worker_id = id, job_id = %job_id, attempt, panic = %message, "job panicked");
            ctx.counters.panicked.increment();
            fail(ctx, job, JobError::new(format!("job panicked: {message}")));
            false
        }
    }
}

fn fail<P, R, E>(ctx: &PoolContext<P, R, E>, mut job: Job<P>, err: JobError)
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    ctx.counters.failed_attempts.increment();
    let decision = ctx.retry.decide(job.attempts(), job.max_attempts(), &err);
    job.record_failure(err);

    // a body that stopped because it was cancelled resolves as cancelled
    if job.is_cancelled() {
        ctx.cancel(job);
        return;
    }

    match decision {
        RetryDecision::Retry(delay) => {
            job.set_state(JobState::Queued);
            let job_id = job.id();
            match ctx.scheduler.schedule_once(job, Instant::now() + delay) {
                Ok(()) => {
                    ctx.counters.retried.increment();
                    debug!(
                        job_id = %job_id,
                        delay_ms = delay.as_millis(),
                        "job scheduled for retry"
                    );
                }
                Err(job) => {
                    ctx.abandon_on_shutdown(job);
                }
            }
        }
        RetryDecision::Abandon => ctx.dead_letter(job),
    }
}
