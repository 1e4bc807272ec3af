//! Configuration models for the pool, queue, retries and scheduler.

pub mod engine;

pub use engine::{EngineConfig, PoolSettings, QueueSettings, RetrySettings, SchedulerSettings};
