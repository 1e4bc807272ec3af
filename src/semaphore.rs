//! Counting semaphore.
//!
//! A [`Semaphore`] is a gate initialized with `N` permits. The job queue uses
//! one to account for free slots (permits = capacity - queued), and job bodies
//! can use their own to bound access to limited external resources such as a
//! connection pool.
//!
//! The internal lock is a leaf: no other lock is ever acquired while it is
//! held, so it sits outside the [`crate::mutex::lock_order`] ranks.
//!
//! ```
//! use job_engine::Semaphore;
//!
//! let gate = Semaphore::new(2);
//! let _a = gate.acquire_guard().unwrap();
//! let _b = gate.acquire_guard().unwrap();
//! assert!(!gate.try_acquire());
//! ```

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Why a blocking acquisition did not obtain a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SemaphoreError {
    /// The semaphore was closed while (or before) waiting.
    #[error("semaphore closed")]
    Closed,
    /// The timeout elapsed before a permit became available.
    #[error("timed out waiting for a permit")]
    TimedOut,
}

/// How a successful acquisition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// A permit was free on arrival.
    Immediately,
    /// The caller blocked until a permit was released.
    AfterWaiting,
}

#[derive(Debug)]
struct State {
    permits: usize,
    waiters: usize,
    closed: bool,
}

/// Counting semaphore built on `parking_lot`.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<State>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore with `permits` free permits.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                waiters: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Take a permit, blocking while none are free.
    ///
    /// # Errors
    ///
    /// Returns [`SemaphoreError::Closed`] if the semaphore is closed.
    pub fn acquire(&self) -> Result<Acquired, SemaphoreError> {
        self.acquire_inner(None)
    }

    /// Take a permit, blocking at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`SemaphoreError::TimedOut`] or [`SemaphoreError::Closed`].
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Acquired, SemaphoreError> {
        self.acquire_inner(Some(Instant::now() + timeout))
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.permits == 0 {
            return false;
        }
        state.permits -= 1;
        true
    }

    /// Take a permit returned as an RAII guard that releases on drop.
    ///
    /// # Errors
    ///
    /// Returns [`SemaphoreError::Closed`] if the semaphore is closed.
    pub fn acquire_guard(&self) -> Result<SemaphorePermit<'_>, SemaphoreError> {
        self.acquire().map(|_| SemaphorePermit { semaphore: self })
    }

    /// Return a permit and wake exactly one waiter, if any.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.permits += 1;
        let wake = state.waiters > 0;
        drop(state);
        if wake {
            self.available.notify_one();
        }
    }

    /// Number of free permits.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.lock().permits
    }

    /// Number of threads blocked in `acquire`.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    /// Close the semaphore: every current and future blocking acquisition
    /// fails with [`SemaphoreError::Closed`]. Releases are still counted.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Whether [`Semaphore::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn acquire_inner(&self, deadline: Option<Instant>) -> Result<Acquired, SemaphoreError> {
        let mut state = self.state.lock();
        let mut waited = false;
        loop {
            if state.closed {
                return Err(SemaphoreError::Closed);
            }
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(if waited {
                    Acquired::AfterWaiting
                } else {
                    Acquired::Immediately
                });
            }
            waited = true;
            state.waiters += 1;
            let timed_out = match deadline {
                Some(deadline) => self.available.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.available.wait(&mut state);
                    false
                }
            };
            state.waiters -= 1;
            if timed_out && state.permits == 0 && !state.closed {
                return Err(SemaphoreError::TimedOut);
            }
        }
    }
}

/// Permit that returns itself to the [`Semaphore`] when dropped.
#[derive(Debug)]
#[must_use = "dropping the permit releases it immediately"]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
