//! API-facing request/response models.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{
    Engine, HealthReport, JobExecutor, JobHandle, JobId, JobOutcome, Priority,
    SubmitError,
};

/// Job submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission<P> {
    /// Opaque payload.
    pub payload: P,
    /// Priority; normal when absent.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Attempt budget; the engine default when absent.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Release delay in milliseconds; queued immediately when absent.
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

impl<P> JobSubmission<P> {
    /// Submission with defaults for everything but the payload.
    pub const fn new(payload: P) -> Self {
        Self {
            payload,
            priority: None,
            max_attempts: None,
            delay_ms: None,
        }
    }
}

/// Job status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    /// Job identifier.
    pub job_id: JobId,
    /// `completed`, `failed`, `dead_lettered`, `cancelled` or `pending`.
    pub status: String,
    /// Failure reason, if any.
    pub reason: Option<String>,
    /// Attempts recorded as failed.
    pub failed_attempts: usize,
}

impl JobStatusResponse {
    /// Status for a job whose outcome is not known yet.
    #[must_use]
    pub fn pending(job_id: JobId) -> Self {
        Self {
            job_id,
            status: String::from("pending"),
            reason: None,
            failed_attempts: 0,
        }
    }

    /// Status for a resolved job.
    #[must_use]
    pub fn from_outcome<R>(job_id: JobId, outcome: &JobOutcome<R>) -> Self {
        let (reason, failed_attempts) = match outcome {
            JobOutcome::Completed(_) | JobOutcome::Cancelled => (None, 0),
            JobOutcome::Failed(err) => (Some(err.message().to_owned()), 0),
            JobOutcome::DeadLettered(history) => (
                history.last().map(|record| record.error.message().to_owned()),
                history.len(),
            ),
        };
        Self {
            job_id,
            status: outcome.label().to_owned(),
            reason,
            failed_attempts,
        }
    }
}

/// Health response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Running with at least one worker.
    pub ok: bool,
    /// Full snapshot.
    #[serde(flatten)]
    pub report: HealthReport,
}

impl From<HealthReport> for HealthResponse {
    fn from(report: HealthReport) -> Self {
        Self {
            ok: report.is_healthy(),
            report,
        }
    }
}

/// Submit a request to an engine, honoring its optional delay. Missing
/// fields take the engine's defaults.
///
/// # Errors
///
/// Whatever [`Engine::submit`] or [`Engine::schedule_after`] refuses.
pub fn submit_job<P, R, E>(
    engine: &Engine<P, R, E>,
    req: JobSubmission<P>,
) -> Result<JobHandle<R>, SubmitError<P>>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    let priority = req.priority.unwrap_or(Priority::NORMAL);
    let max_attempts = req
        .max_attempts
        .unwrap_or(engine.config().retry.default_max_attempts);
    match req.delay_ms {
        Some(ms) if ms > 0 => {
            engine.schedule_after(req.payload, Duration::from_millis(ms), priority, max_attempts)
        }
        _ => engine.submit(req.payload, priority, max_attempts),
    }
}

/// Return a health payload.
pub fn health<P, R, E>(engine: &Engine<P, R, E>) -> HealthResponse
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: JobExecutor<P, R>,
{
    HealthResponse::from(engine.health_check())
}
