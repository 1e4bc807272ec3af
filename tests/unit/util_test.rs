//! Tests for utility functions

use job_engine::util::{init_tracing, init_tracing_with, now_ms, panic_message, DEFAULT_FILTER};

#[test]
fn test_init_tracing_installs_once() {
    init_tracing_with("job_engine=debug");
    assert!(tracing::dispatcher::has_been_set());

    // later calls never replace the global subscriber
    assert!(!init_tracing());
    assert!(!init_tracing_with("job_engine=trace"));
    tracing::debug!(worker_id = 0, "logging after init");
}

#[test]
fn test_default_filter_targets_crate() {
    assert!(DEFAULT_FILTER.starts_with("job_engine="));
}

#[test]
fn test_now_ms_advances() {
    let before = now_ms();
    std::thread::sleep(std::time::Duration::from_millis(2));
    assert!(now_ms() > before);
}

#[test]
fn test_panic_message_from_caught_panic() {
    let caught = std::panic::catch_unwind(|| panic!("factory failed: {}", 3)).unwrap_err();
    assert_eq!(panic_message(caught.as_ref()), "factory failed: 3");
}
