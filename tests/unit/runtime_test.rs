//! Tests for API request/response models

use std::time::Duration;

use async_trait::async_trait;
use job_engine::config::EngineConfig;
use job_engine::core::{
    Engine, FailureRecord, JobContext, JobError, JobExecutor, JobId, JobOutcome, Priority,
};
use job_engine::runtime::{health, submit_job, JobStatusResponse, JobSubmission};

#[derive(Clone)]
struct Echo;

#[async_trait]
impl JobExecutor<String, String> for Echo {
    async fn execute(&self, payload: &String, _ctx: JobContext) -> Result<String, JobError> {
        Ok(payload.clone())
    }
}

fn engine() -> Engine<String, String, Echo> {
    let mut cfg = EngineConfig::default();
    cfg.pool.worker_count = 1;
    Engine::new(cfg, Echo).unwrap()
}

#[test]
fn test_submission_deserializes_with_defaults() {
    let req: JobSubmission<String> = serde_json::from_str(r#"{"payload": "hi"}"#).unwrap();
    assert_eq!(req.payload, "hi");
    assert!(req.priority.is_none());
    assert!(req.max_attempts.is_none());
    assert!(req.delay_ms.is_none());

    let req: JobSubmission<u32> =
        serde_json::from_str(r#"{"payload": 1, "priority": 10, "delay_ms": 5}"#).unwrap();
    assert_eq!(req.priority, Some(Priority::HIGH));
    assert_eq!(req.delay_ms, Some(5));
}

#[test]
fn test_submit_job_immediate_and_delayed() {
    let engine = engine();
    engine.start_default().unwrap();

    let now = submit_job(&engine, JobSubmission::new("now".to_string())).unwrap();
    let mut later = JobSubmission::new("later".to_string());
    later.delay_ms = Some(20);
    let later = submit_job(&engine, later).unwrap();

    assert_eq!(
        now.wait_timeout(Duration::from_secs(5)).unwrap(),
        JobOutcome::Completed("now".to_string())
    );
    assert_eq!(
        later.wait_timeout(Duration::from_secs(5)).unwrap(),
        JobOutcome::Completed("later".to_string())
    );
    engine.shutdown(true, Duration::from_secs(1));
}

#[test]
fn test_status_from_outcome() {
    let id = JobId::from_parts(1, 7);
    let done = JobStatusResponse::from_outcome(id, &JobOutcome::Completed(()));
    assert_eq!(done.status, "completed");
    assert!(done.reason.is_none());

    let history = vec![
        FailureRecord {
            attempt: 1,
            error: JobError::new("first"),
            at_ms: 1,
        },
        FailureRecord {
            attempt: 2,
            error: JobError::new("second"),
            at_ms: 2,
        },
    ];
    let dead = JobStatusResponse::from_outcome::<()>(id, &JobOutcome::DeadLettered(history));
    assert_eq!(dead.status, "dead_lettered");
    assert_eq!(dead.reason.as_deref(), Some("second"));
    assert_eq!(dead.failed_attempts, 2);

    assert_eq!(JobStatusResponse::pending(id).status, "pending");
}

#[test]
fn test_health_response() {
    let engine = engine();
    let before = health(&engine);
    assert!(!before.ok);

    engine.start(1).unwrap();
    let running = health(&engine);
    assert!(running.ok);
    assert_eq!(running.report.worker_count, 1);

    let json = serde_json::to_value(&running).unwrap();
    assert_eq!(json["ok"], true);
    assert_eq!(json["state"], "running");
    assert!(json["counters"]["submitted"].is_u64());

    engine.shutdown(true, Duration::from_secs(1));
    assert!(!health(&engine).ok);
}
