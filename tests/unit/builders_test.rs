//! Tests for the engine builder

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use job_engine::builders::EngineBuilder;
use job_engine::core::{
    EngineError, EngineState, FixedDelay, InMemoryDeadLetterSink, JobContext, JobError,
    JobExecutor, JobOutcome, Priority,
};

#[derive(Clone)]
struct AlwaysFails;

#[async_trait]
impl JobExecutor<u32, ()> for AlwaysFails {
    async fn execute(&self, _payload: &u32, _ctx: JobContext) -> Result<(), JobError> {
        Err(JobError::new("nope"))
    }
}

#[test]
fn test_builder_defaults() {
    let builder = EngineBuilder::<u32>::new();
    assert_eq!(builder.config().queue.capacity, 1024);
    let engine = builder.build(AlwaysFails).unwrap();
    assert_eq!(engine.state(), EngineState::Created);
}

#[test]
fn test_builder_overrides() {
    let builder = EngineBuilder::<u32>::new()
        .workers(2)
        .queue_capacity(8)
        .default_max_attempts(4)
        .shutdown_timeout(Duration::from_millis(750));
    let cfg = builder.config();
    assert_eq!(cfg.pool.worker_count, 2);
    assert_eq!(cfg.queue.capacity, 8);
    assert_eq!(cfg.retry.default_max_attempts, 4);
    assert_eq!(cfg.shutdown_timeout_ms, 750);
}

#[test]
fn test_builder_rejects_invalid_config() {
    let result = EngineBuilder::<u32>::new().queue_capacity(0).build(AlwaysFails);
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
}

#[test]
fn test_builder_custom_parts_are_used() {
    let sink = Arc::new(InMemoryDeadLetterSink::<u32>::new(10));
    let engine = EngineBuilder::new()
        .retry_policy(FixedDelay(Duration::from_millis(1)))
        .dead_letter_sink(sink.clone())
        .build(AlwaysFails)
        .unwrap();
    engine.start(1).unwrap();

    let handle = engine.submit(9, Priority::NORMAL, 2).unwrap();
    let outcome = handle.wait_timeout(Duration::from_secs(5)).unwrap();
    match outcome {
        JobOutcome::DeadLettered(history) => assert_eq!(history.len(), 2),
        other => panic!("expected dead letter, got {}", other.label()),
    }

    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload, 9);
    assert_eq!(entries[0].attempts, 2);

    engine.shutdown(false, Duration::from_secs(1));
}
