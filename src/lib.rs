//! # Job Engine
//!
//! A concurrent job-processing engine: a bounded worker pool pulling from a
//! priority queue, with per-job retries, delayed and periodic scheduling,
//! backpressure, dead-lettering and graceful shutdown.
//!
//! ## Core Problem Solved
//!
//! Background work in a long-running service has to run off the request path
//! without piling up without bound or vanishing on failure:
//!
//! - **Backpressure**: The queue is bounded; callers choose to be refused or to wait
//! - **Priorities**: Higher-priority jobs are handed out first, FIFO within a tier
//! - **Retries**: Failed attempts are re-run after a backoff, up to a per-job budget
//! - **Dead letters**: Exhausted jobs are recorded with their full failure history
//! - **Scheduling**: One-shot delays and non-overlapping periodic series
//! - **Shutdown**: Drain or discard, with a bounded wait that never kills a worker
//!
//! ## Engine
//!
//! Workers are dedicated OS threads, each driving its own single-threaded
//! tokio runtime, so job bodies may be `async` without blocking a caller's
//! runtime.
//!
//! ```rust,ignore
//! use job_engine::builders::EngineBuilder;
//! use job_engine::core::Priority;
//! use std::time::Duration;
//!
//! let engine = EngineBuilder::new()
//!     .queue_capacity(500)
//!     .build(my_executor)?; // implements JobExecutor
//! engine.start(4)?;
//!
//! let handle = engine.submit(job, Priority::HIGH, 3)?;
//! let outcome = handle.wait_timeout(Duration::from_secs(120))?;
//!
//! let report = engine.shutdown(true, Duration::from_secs(30));
//! ```
//!
//! ## Synchronization primitives
//!
//! The engine is built on the crate's own wrappers around `parking_lot`:
//! a ranked [`mutex::Mutex`] that rejects re-entrant and out-of-order
//! acquisition, a [`condvar::Condvar`], a counting [`semaphore::Semaphore`]
//! and an [`counter::AtomicCounter`]. They are public and usable on their own.
//!
//! For complete examples, see:
//! - `tests/engine_test.rs` - Full integration tests
//! - `DESIGN.md` - Design notes

#![deny(unsafe_code)]

/// Condition variable paired with the crate mutex.
pub mod condvar;
/// Lock-free counter.
pub mod counter;
/// Ranked mutex with order checking.
pub mod mutex;
/// Counting semaphore.
pub mod semaphore;

/// Jobs, queue, scheduler, retries, worker pool and the engine.
pub mod core;
/// Configuration models for the pool, queue, retries and scheduler.
pub mod config;
/// Builders to construct an engine from configuration.
pub mod builders;
/// API request/response models.
pub mod runtime;
/// Shared utilities.
pub mod util;

pub use crate::builders::EngineBuilder;
pub use crate::config::EngineConfig;
pub use crate::core::{
    Engine, EngineError, JobContext, JobError, JobExecutor, JobHandle, JobId, JobOutcome, Priority,
    ShutdownReport, SubmitError,
};

pub use crate::condvar::Condvar;
pub use crate::counter::AtomicCounter;
pub use crate::mutex::{Mutex, MutexGuard};
pub use crate::semaphore::{Semaphore, SemaphorePermit};
