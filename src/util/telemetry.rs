//! Structured logging setup.
//!
//! Engine events carry `worker_id`, `job_id`, `series_id` and `attempt`
//! fields. Worker and timer threads are named, so the default subscriber
//! prints thread names too.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "job_engine=info";

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_FILTER`]. Returns `false` if a global subscriber already exists;
/// callers that install their own subscriber first are left alone.
pub fn init_tracing() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter)
}

/// Like [`init_tracing`] with explicit directives, e.g. `"job_engine=debug"`.
pub fn init_tracing_with(directives: &str) -> bool {
    install(EnvFilter::new(directives))
}

fn install(filter: EnvFilter) -> bool {
    if tracing::dispatcher::has_been_set() {
        return false;
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
