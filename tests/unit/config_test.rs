//! Tests for configuration validation

use std::collections::HashMap;
use std::time::Duration;

use job_engine::config::EngineConfig;

#[test]
fn test_default_config_is_valid() {
    let cfg = EngineConfig::default();
    assert!(cfg.validate().is_ok());
    assert!(cfg.pool.worker_count >= 1);
    assert_eq!(cfg.queue.capacity, 1024);
    assert_eq!(cfg.retry.default_max_attempts, 3);
    assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(30));
}

#[test]
fn test_zero_capacity_rejected() {
    let mut cfg = EngineConfig::default();
    cfg.queue.capacity = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_zero_workers_rejected() {
    let mut cfg = EngineConfig::default();
    cfg.pool.worker_count = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_zero_attempts_rejected() {
    let mut cfg = EngineConfig::default();
    cfg.retry.default_max_attempts = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_inverted_backoff_rejected() {
    let mut cfg = EngineConfig::default();
    cfg.retry.base_delay_ms = 5_000;
    cfg.retry.max_delay_ms = 1_000;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_from_json_partial() {
    let json = r#"{
        "pool": { "worker_count": 4 },
        "queue": { "capacity": 16 },
        "shutdown_timeout_ms": 500
    }"#;
    let cfg = EngineConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.pool.worker_count, 4);
    assert_eq!(cfg.pool.thread_name_prefix, "job-worker");
    assert_eq!(cfg.queue.capacity, 16);
    assert_eq!(cfg.retry.base_delay_ms, 100);
    assert_eq!(cfg.shutdown_timeout(), Duration::from_millis(500));
}

#[test]
fn test_from_json_invalid() {
    assert!(EngineConfig::from_json_str("not json").is_err());
    assert!(EngineConfig::from_json_str(r#"{"queue": {"capacity": 0}}"#).is_err());
}

#[test]
fn test_apply_env_overrides() {
    let vars: HashMap<&str, &str> = [
        ("JOB_ENGINE_WORKERS", "3"),
        ("JOB_ENGINE_QUEUE_CAPACITY", " 64 "),
        ("JOB_ENGINE_MAX_ATTEMPTS", "5"),
        ("JOB_ENGINE_SHUTDOWN_TIMEOUT_MS", "250"),
    ]
    .into_iter()
    .collect();

    let mut cfg = EngineConfig::default();
    cfg.apply_env(|key| vars.get(key).map(|v| (*v).to_string()))
        .unwrap();

    assert_eq!(cfg.pool.worker_count, 3);
    assert_eq!(cfg.queue.capacity, 64);
    assert_eq!(cfg.retry.default_max_attempts, 5);
    assert_eq!(cfg.shutdown_timeout_ms, 250);
    assert_eq!(cfg.retry.base_delay_ms, 100);
}

#[test]
fn test_apply_env_rejects_garbage() {
    let mut cfg = EngineConfig::default();
    let err = cfg
        .apply_env(|key| (key == "JOB_ENGINE_WORKERS").then(|| "many".to_string()))
        .unwrap_err();
    assert!(err.contains("JOB_ENGINE_WORKERS"));
}
