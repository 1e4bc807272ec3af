//! Tests for error types

use job_engine::core::{EngineError, JobError, SubmitError};

#[test]
fn test_invalid_config_error() {
    let err = EngineError::InvalidConfig("queue.capacity must be greater than 0".to_string());
    assert_eq!(
        format!("{}", err),
        "invalid config: queue.capacity must be greater than 0"
    );
}

#[test]
fn test_lifecycle_errors() {
    assert_eq!(format!("{}", EngineError::AlreadyStarted), "engine already started");
    assert_eq!(format!("{}", EngineError::ShuttingDown), "engine is shutting down");
    assert_eq!(format!("{}", EngineError::Timeout), "timed out");
}

#[test]
fn test_submit_error_hands_back_payload() {
    let err = SubmitError::Rejected(vec![1, 2, 3]);
    assert!(err.is_backpressure());
    assert_eq!(format!("{}", err), "queue full: job rejected");
    assert_eq!(err.into_payload(), vec![1, 2, 3]);

    let err = SubmitError::ShuttingDown("payload");
    assert!(!err.is_backpressure());
    assert_eq!(err.into_payload(), "payload");
}

#[test]
fn test_submit_error_converts_to_anyhow() {
    fn refuse() -> anyhow::Result<()> {
        Err(SubmitError::TimedOut(7u8).into())
    }
    let err = refuse().unwrap_err();
    assert_eq!(err.to_string(), "timed out waiting for queue capacity");
}

#[test]
fn test_job_error_permanence() {
    let transient = JobError::new("connection reset");
    let permanent = JobError::permanent("bad input");
    assert!(!transient.is_permanent());
    assert!(permanent.is_permanent());
    assert_eq!(permanent.to_string(), "bad input");
}
