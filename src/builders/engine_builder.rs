//! Builder assembling an [`Engine`] from configuration and optional parts.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::core::{
    DeadLetterSink, Engine, EngineError, ExponentialBackoff, JobExecutor, RetryPolicy,
    TracingDeadLetterSink,
};

/// Collects configuration, a retry policy and a dead-letter sink, then builds
/// an [`Engine`]. Unset parts fall back to exponential backoff from the
/// config and a tracing sink.
pub struct EngineBuilder<P> {
    config: EngineConfig,
    retry: Option<Arc<dyn RetryPolicy>>,
    dead_letter: Option<Arc<dyn DeadLetterSink<P>>>,
}

impl<P> Default for EngineBuilder<P> {
    fn default() -> Self {
        Self::from_config(EngineConfig::default())
    }
}

impl<P> EngineBuilder<P> {
    /// Start from defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    #[must_use]
    pub const fn from_config(config: EngineConfig) -> Self {
        Self {
            config,
            retry: None,
            dead_letter: None,
        }
    }

    /// Apply `JOB_ENGINE_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] if a variable does not parse.
    pub fn with_env(mut self) -> Result<Self, EngineError> {
        let _ = dotenvy::dotenv();
        self.config
            .apply_env(|key| std::env::var(key).ok())
            .map_err(EngineError::InvalidConfig)?;
        Ok(self)
    }

    /// Default pool size.
    #[must_use]
    pub const fn workers(mut self, count: usize) -> Self {
        self.config.pool.worker_count = count;
        self
    }

    /// Queue capacity.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue.capacity = capacity;
        self
    }

    /// Attempt budget used by callers that don't pick one.
    #[must_use]
    pub const fn default_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.default_max_attempts = attempts;
        self
    }

    /// Default shutdown wait.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: impl RetryPolicy) -> Self {
        self.retry = Some(Arc::new(policy));
        self
    }

    /// Replace the dead-letter sink.
    #[must_use]
    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink<P>>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Configuration collected so far.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build the engine around `executor`. The engine is not started.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] if the configuration fails validation.
    pub fn build<R, E>(self, executor: E) -> Result<Engine<P, R, E>, EngineError>
    where
        P: Send + Sync + 'static,
        R: Send + 'static,
        E: JobExecutor<P, R>,
    {
        let retry: Arc<dyn RetryPolicy> = match self.retry {
            Some(policy) => policy,
            None => Arc::new(ExponentialBackoff::new(
                Duration::from_millis(self.config.retry.base_delay_ms),
                Duration::from_millis(self.config.retry.max_delay_ms),
            )),
        };
        let dead_letter: Arc<dyn DeadLetterSink<P>> = match self.dead_letter {
            Some(sink) => sink,
            None => Arc::new(TracingDeadLetterSink),
        };
        Engine::with_parts(self.config, executor, retry, dead_letter)
    }
}
