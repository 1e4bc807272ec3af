//! Condition variable implementation.
//!
//! This module provides a condition variable that waits on this crate's
//! ordered [`MutexGuard`]. Waiting releases the mutex (and its ownership
//! record) for the duration of the wait and restores both before returning,
//! so the reentrancy check stays accurate across waits.

use std::time::{Duration, Instant};

use crate::mutex::MutexGuard;

pub use parking_lot::WaitTimeoutResult;

/// A condition variable.
///
/// Condition variables represent the ability to block a thread such that
/// it consumes no CPU time while waiting for an event to occur. Unlike
/// `std::sync::Condvar`, this type does not implement poisoning.
///
/// # Examples
///
/// ```
/// use job_engine::{Mutex, Condvar};
/// use std::sync::Arc;
/// use std::thread;
///
/// let pair = Arc::new((Mutex::new(false), Condvar::new()));
/// let pair2 = Arc::clone(&pair);
///
/// thread::spawn(move || {
///     let (lock, cvar) = &*pair2;
///     let mut started = lock.lock();
///     *started = true;
///     cvar.notify_one();
/// });
///
/// let (lock, cvar) = &*pair;
/// let mut started = lock.lock();
/// while !*started {
///     cvar.wait(&mut started);
/// }
/// ```
#[derive(Debug, Default)]
pub struct Condvar {
    inner: parking_lot::Condvar,
}

impl Condvar {
    /// Creates a new condition variable.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: parking_lot::Condvar::new(),
        }
    }

    /// Blocks the current thread until this condition variable receives a notification.
    ///
    /// The mutex behind `guard` is released while blocked and re-acquired
    /// before returning. Spurious wakeups are possible; callers loop on their
    /// predicate.
    #[inline]
    pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
        guard.while_released(|raw| self.inner.wait(raw));
    }

    /// Blocks until notified and `condition` returns `false`.
    #[inline]
    pub fn wait_while<T, F>(&self, guard: &mut MutexGuard<'_, T>, condition: F)
    where
        F: FnMut(&mut T) -> bool,
    {
        guard.while_released(|raw| self.inner.wait_while(raw, condition));
    }

    /// Blocks until notified or `deadline` passes.
    #[inline]
    pub fn wait_until<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Instant,
    ) -> WaitTimeoutResult {
        guard.while_released(|raw| self.inner.wait_until(raw, deadline))
    }

    /// Blocks until notified or `timeout` elapses.
    #[inline]
    pub fn wait_for<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> WaitTimeoutResult {
        guard.while_released(|raw| self.inner.wait_for(raw, timeout))
    }

    /// Wakes up one blocked thread on this condvar.
    ///
    /// Calls to `notify_one` are not buffered in any way.
    #[inline]
    pub fn notify_one(&self) -> bool {
        self.inner.notify_one()
    }

    /// Wakes up all blocked threads on this condvar. Returns how many were woken.
    #[inline]
    pub fn notify_all(&self) -> usize {
        self.inner.notify_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::LockError;
    use crate::Mutex;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_wait_notify() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let pair2 = Arc::clone(&pair);

        thread::spawn(move || {
            let (lock, cvar) = &*pair2;
            thread::sleep(Duration::from_millis(10));
            let mut started = lock.lock();
            *started = true;
            cvar.notify_one();
        });

        let (lock, cvar) = &*pair;
        let mut started = lock.lock();
        while !*started {
            cvar.wait(&mut started);
        }
        assert!(*started);
    }

    #[test]
    fn test_notify_all() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let mut handles = vec![];

        for _ in 0..5 {
            let pair = Arc::clone(&pair);
            let handle = thread::spawn(move || {
                let (lock, cvar) = &*pair;
                let mut started = lock.lock();
                while !*started {
                    cvar.wait(&mut started);
                }
            });
            handles.push(handle);
        }

        thread::sleep(Duration::from_millis(10));

        {
            let (lock, cvar) = &*pair;
            let mut started = lock.lock();
            *started = true;
            cvar.notify_all();
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_wait_while() {
        let pair = Arc::new((Mutex::new(0), Condvar::new()));
        let pair2 = Arc::clone(&pair);

        thread::spawn(move || {
            let (lock, cvar) = &*pair2;
            for i in 1..=10 {
                thread::sleep(Duration::from_millis(5));
                let mut count = lock.lock();
                *count = i;
                cvar.notify_one();
            }
        });

        let (lock, cvar) = &*pair;
        let mut count = lock.lock();
        cvar.wait_while(&mut count, |c| *c < 10);
        assert_eq!(*count, 10);
    }

    #[test]
    fn test_wait_for_times_out() {
        let lock = Mutex::new(());
        let cvar = Condvar::new();
        let mut guard = lock.lock();
        let started = Instant::now();
        let result = cvar.wait_for(&mut guard, Duration::from_millis(20));
        assert!(result.timed_out());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_ownership_restored_after_wait() {
        let lock = Mutex::new(());
        let cvar = Condvar::new();
        let mut guard = lock.lock();
        let _ = cvar.wait_for(&mut guard, Duration::from_millis(1));
        assert!(matches!(lock.checked_lock(), Err(LockError::Reentrant { .. })));
    }

    #[test]
    fn test_other_thread_locks_during_wait() {
        let pair = Arc::new((Mutex::new(0u32), Condvar::new()));
        let pair2 = Arc::clone(&pair);

        let (lock, cvar) = &*pair;
        let mut value = lock.lock();

        let writer = thread::spawn(move || {
            let (lock, cvar) = &*pair2;
            let mut value = lock.lock();
            *value = 7;
            cvar.notify_one();
        });

        while *value != 7 {
            cvar.wait(&mut value);
        }
        drop(value);
        writer.join().unwrap();
    }
}
