//! Engine configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker thread settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Workers spawned by `start` when no explicit size is given.
    pub worker_count: usize,
    /// Stack size per worker thread in bytes; the platform default when unset.
    pub thread_stack_size: Option<usize>,
    /// How long an idle worker waits on the queue before re-checking its
    /// retirement flag.
    pub idle_poll_ms: u64,
    /// Worker threads are named `{prefix}-{id}`.
    pub thread_name_prefix: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            thread_stack_size: None,
            idle_poll_ms: 50,
            thread_name_prefix: String::from("job-worker"),
        }
    }
}

/// Queue bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum queued jobs before submissions are refused or block.
    pub capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Default exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Base delay; retry `n` waits `base * 2^n`.
    pub base_delay_ms: u64,
    /// Cap on any single retry delay.
    pub max_delay_ms: u64,
    /// Attempt budget used when a submission does not give one.
    pub default_max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            default_max_attempts: 3,
        }
    }
}

/// Timer thread settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Delay before a due job refused by a full queue is offered again.
    pub requeue_delay_ms: u64,
    /// Name of the timer thread.
    pub thread_name: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            requeue_delay_ms: 50,
            thread_name: String::from("job-scheduler"),
        }
    }
}

/// Root engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool.
    pub pool: PoolSettings,
    /// Job queue.
    pub queue: QueueSettings,
    /// Default retry policy.
    pub retry: RetrySettings,
    /// Scheduler timer.
    pub scheduler: SchedulerSettings,
    /// Default shutdown wait in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            queue: QueueSettings::default(),
            retry: RetrySettings::default(),
            scheduler: SchedulerSettings::default(),
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool.worker_count == 0 {
            return Err("pool.worker_count must be greater than 0".into());
        }
        if self.pool.idle_poll_ms == 0 {
            return Err("pool.idle_poll_ms must be greater than 0".into());
        }
        if self.pool.thread_name_prefix.is_empty() {
            return Err("pool.thread_name_prefix must not be empty".into());
        }
        if self.queue.capacity == 0 {
            return Err("queue.capacity must be greater than 0".into());
        }
        if self.retry.default_max_attempts == 0 {
            return Err("retry.default_max_attempts must be at least 1".into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err("retry.base_delay_ms must not exceed retry.max_delay_ms".into());
        }
        if self.scheduler.requeue_delay_ms == 0 {
            return Err("scheduler.requeue_delay_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate. Missing fields
    /// take their defaults.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `JOB_ENGINE_*` environment variables, after
    /// loading a `.env` file if one exists.
    ///
    /// Recognized: `JOB_ENGINE_WORKERS`, `JOB_ENGINE_QUEUE_CAPACITY`,
    /// `JOB_ENGINE_MAX_ATTEMPTS`, `JOB_ENGINE_RETRY_BASE_MS`,
    /// `JOB_ENGINE_RETRY_MAX_MS`, `JOB_ENGINE_SHUTDOWN_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from `lookup` (a variable name to value function).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
            value
                .trim()
                .parse()
                .map_err(|_| format!("{key}: cannot parse `{value}`"))
        }

        if let Some(v) = lookup("JOB_ENGINE_WORKERS") {
            self.pool.worker_count = parse("JOB_ENGINE_WORKERS", &v)?;
        }
        if let Some(v) = lookup("JOB_ENGINE_QUEUE_CAPACITY") {
            self.queue.capacity = parse("JOB_ENGINE_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("JOB_ENGINE_MAX_ATTEMPTS") {
            self.retry.default_max_attempts = parse("JOB_ENGINE_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("JOB_ENGINE_RETRY_BASE_MS") {
            self.retry.base_delay_ms = parse("JOB_ENGINE_RETRY_BASE_MS", &v)?;
        }
        if let Some(v) = lookup("JOB_ENGINE_RETRY_MAX_MS") {
            self.retry.max_delay_ms = parse("JOB_ENGINE_RETRY_MAX_MS", &v)?;
        }
        if let Some(v) = lookup("JOB_ENGINE_SHUTDOWN_TIMEOUT_MS") {
            self.shutdown_timeout_ms = parse("JOB_ENGINE_SHUTDOWN_TIMEOUT_MS", &v)?;
        }
        Ok(())
    }

    /// Shutdown wait as a [`Duration`].
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Idle poll interval as a [`Duration`].
    #[must_use]
    pub const fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.pool.idle_poll_ms)
    }

    /// Scheduler requeue delay as a [`Duration`].
    #[must_use]
    pub const fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.scheduler.requeue_delay_ms)
    }
}
