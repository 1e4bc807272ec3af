//! Mutex implementation with lock-order enforcement.
//!
//! This module provides a mutual exclusion primitive built on top of the
//! battle-tested `parking_lot` crate, extended with the engine's
//! deadlock-avoidance discipline.
//!
//! # Lock ordering
//!
//! Every [`Mutex`] carries a [`LockKey`]: a class rank (see [`lock_order`])
//! plus an instance id assigned from a global creation counter. A thread may
//! only acquire a key strictly greater than every key it currently holds.
//! Code that needs two locks at once uses [`lock_pair`], which sorts the
//! acquisition by key. No runtime deadlock detector exists; ordering is the
//! only mechanism.
//!
//! # Reentrancy
//!
//! [`Mutex`] is non-reentrant. Re-acquiring it on the owning thread is a
//! programming error: [`Mutex::checked_lock`] reports it as
//! [`LockError::Reentrant`] and [`Mutex::lock`] panics. Use
//! [`ReentrantMutex`] when nested acquisition is intended.
//!
//! Release happens when the [`MutexGuard`] is dropped, so every exit path
//! (including `?` and unwinding) releases the lock, and releasing an unheld
//! mutex cannot be expressed.
//!
//! # Examples
//!
//! ```
//! use job_engine::Mutex;
//!
//! let mutex = Mutex::new(0);
//! *mutex.lock() = 10;
//! assert_eq!(*mutex.lock(), 10);
//! ```
//!
//! Acquiring two locks in the global order:
//!
//! ```
//! use job_engine::mutex::{lock_pair, Mutex};
//!
//! let a = Mutex::new(1);
//! let b = Mutex::new(2);
//! let (mut ga, gb) = lock_pair(&b, &a);
//! *ga += *gb;
//! assert_eq!(*ga, 3);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::counter::AtomicCounter;

// Re-export parking_lot's reentrant mutex for the explicit opt-in case
pub use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// Class ranks for every lock the engine creates.
///
/// Locks are acquired in ascending rank; within a rank, in ascending instance
/// id. The engine itself never nests locks of different components, so the
/// ranks mostly matter for code that combines them (e.g. moving jobs between
/// two queues, which both have rank [`QUEUE`]).
pub mod lock_order {
    /// Default rank for user-created mutexes.
    pub const UNRANKED: u32 = 0;
    /// Engine job registry (result senders and cancellation tokens).
    pub const REGISTRY: u32 = 10;
    /// Worker pool slot table.
    pub const POOL: u32 = 20;
    /// Scheduler due-time heap.
    pub const SCHEDULER: u32 = 30;
    /// Job queue heap and shutdown state.
    pub const QUEUE: u32 = 40;
    /// Dead-letter sink storage.
    pub const SINK: u32 = 50;
}

static NEXT_LOCK_ID: AtomicCounter = AtomicCounter::new(0);
static NEXT_THREAD_TOKEN: AtomicCounter = AtomicCounter::new(0);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.increment();
    static HELD: RefCell<Vec<LockKey>> = const { RefCell::new(Vec::new()) };
}

fn thread_token() -> u64 {
    THREAD_TOKEN.try_with(|t| *t).unwrap_or(0)
}

fn highest_held() -> Option<LockKey> {
    HELD.try_with(|held| held.borrow().iter().max().copied())
        .ok()
        .flatten()
}

fn push_held(key: LockKey) {
    let _ = HELD.try_with(|held| held.borrow_mut().push(key));
}

fn pop_held(key: LockKey) {
    let _ = HELD.try_with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|k| *k == key) {
            held.remove(pos);
        }
    });
}

/// Position of a lock in the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey {
    /// Class rank from [`lock_order`].
    pub rank: u32,
    /// Creation-order instance id.
    pub id: u64,
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rank, self.id)
    }
}

/// Misuse of a [`Mutex`]. These indicate logic defects, never runtime
/// conditions, and are not retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The owning thread tried to acquire the mutex again.
    #[error("mutex `{name}` re-acquired by its owning thread (non-reentrant)")]
    Reentrant {
        /// Name of the mutex.
        name: &'static str,
    },
    /// Acquisition would break the global lock order.
    #[error("lock order violation: acquiring `{name}` ({requested}) while holding {held}")]
    OrderViolation {
        /// Name of the mutex being acquired.
        name: &'static str,
        /// Highest key held by this thread.
        held: LockKey,
        /// Key of the mutex being acquired.
        requested: LockKey,
    },
}

/// Non-reentrant mutex with an ordering key.
pub struct Mutex<T> {
    key: LockKey,
    name: &'static str,
    owner: AtomicU64,
    inner: parking_lot::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Create an unranked mutex; it orders by creation.
    pub fn new(value: T) -> Self {
        Self::ranked(lock_order::UNRANKED, "mutex", value)
    }

    /// Create a mutex in the given [`lock_order`] class.
    pub fn ranked(rank: u32, name: &'static str, value: T) -> Self {
        Self {
            key: LockKey {
                rank,
                id: NEXT_LOCK_ID.increment(),
            },
            name,
            owner: AtomicU64::new(0),
            inner: parking_lot::Mutex::new(value),
        }
    }

    /// Ordering key of this mutex.
    #[must_use]
    pub const fn key(&self) -> LockKey {
        self.key
    }

    /// Acquire the lock, reporting misuse instead of deadlocking.
    ///
    /// # Errors
    ///
    /// - [`LockError::Reentrant`] if this thread already owns the mutex
    /// - [`LockError::OrderViolation`] if this thread holds a lock with an
    ///   equal or higher key
    pub fn checked_lock(&self) -> Result<MutexGuard<'_, T>, LockError> {
        let me = thread_token();
        if me != 0 && self.owner.load(Ordering::Acquire) == me {
            return Err(LockError::Reentrant { name: self.name });
        }
        if let Some(held) = highest_held() {
            if held >= self.key {
                return Err(LockError::OrderViolation {
                    name: self.name,
                    held,
                    requested: self.key,
                });
            }
        }
        let inner = self.inner.lock();
        Ok(self.adopt(inner, me))
    }

    /// Acquire the lock, blocking until it is available.
    ///
    /// # Panics
    ///
    /// Panics on reentrant acquisition or a lock-order violation; see
    /// [`Mutex::checked_lock`].
    pub fn lock(&self) -> MutexGuard<'_, T> {
        match self.checked_lock() {
            Ok(guard) => guard,
            Err(e) => panic!("{e}"),
        }
    }

    /// Attempt to acquire the lock without blocking.
    ///
    /// Returns `None` if the lock is held, including by the calling thread.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let me = thread_token();
        if me != 0 && self.owner.load(Ordering::Acquire) == me {
            return None;
        }
        let inner = self.inner.try_lock()?;
        Some(self.adopt(inner, me))
    }

    /// Whether any thread currently holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Consume the mutex and return the value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// Mutable access without locking (requires unique ownership).
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    fn adopt<'a>(&'a self, inner: parking_lot::MutexGuard<'a, T>, me: u64) -> MutexGuard<'a, T> {
        self.owner.store(me, Ordering::Release);
        push_held(self.key);
        MutexGuard { mutex: self, inner }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Scoped ownership of a [`Mutex`]; dropping it releases the lock.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    inner: parking_lot::MutexGuard<'a, T>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// Run `f` with the raw guard while ownership bookkeeping is suspended.
    /// Used by [`crate::Condvar`], whose waits release the lock.
    pub(crate) fn while_released<R>(
        &mut self,
        f: impl FnOnce(&mut parking_lot::MutexGuard<'a, T>) -> R,
    ) -> R {
        self.mutex.owner.store(0, Ordering::Release);
        let result = f(&mut self.inner);
        self.mutex.owner.store(thread_token(), Ordering::Release);
        result
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // owner is cleared before `inner` unlocks
        self.mutex.owner.store(0, Ordering::Release);
        pop_held(self.mutex.key);
    }
}

/// Acquire two mutexes in ascending [`LockKey`] order, whatever the argument
/// order. Guards are returned in argument order.
///
/// # Panics
///
/// Panics if the calling thread already holds either mutex or a higher-keyed
/// lock.
pub fn lock_pair<'a, A, B>(
    a: &'a Mutex<A>,
    b: &'a Mutex<B>,
) -> (MutexGuard<'a, A>, MutexGuard<'a, B>) {
    if a.key() < b.key() {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mutex_new() {
        let mutex = Mutex::new(42);
        assert_eq!(*mutex.lock(), 42);
    }

    #[test]
    fn test_mutex_lock_unlock() {
        let mutex = Mutex::new(0);

        {
            let mut guard = mutex.lock();
            *guard = 10;
        }

        assert_eq!(*mutex.lock(), 10);
    }

    #[test]
    fn test_mutex_concurrent_access() {
        let mutex = Arc::new(Mutex::new(0));
        let mut handles = vec![];

        for _ in 0..10 {
            let mutex = Arc::clone(&mutex);
            handles.push(thread::spawn(move || {
                let mut num = mutex.lock();
                *num += 1;
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*mutex.lock(), 10);
    }

    #[test]
    fn test_mutex_try_lock_own_thread() {
        let mutex = Mutex::new(5);
        let guard = mutex.try_lock().expect("uncontended");
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_mutex_is_locked() {
        let mutex = Mutex::new(0);
        assert!(!mutex.is_locked());

        let _guard = mutex.lock();
        assert!(mutex.is_locked());
    }

    #[test]
    fn test_reentrant_acquire_is_reported() {
        let mutex = Mutex::ranked(lock_order::QUEUE, "queue", ());
        let _guard = mutex.lock();
        assert_eq!(
            mutex.checked_lock().err(),
            Some(LockError::Reentrant { name: "queue" })
        );
    }

    #[test]
    #[should_panic(expected = "re-acquired by its owning thread")]
    fn test_reentrant_lock_panics() {
        let mutex = Mutex::new(());
        let _first = mutex.lock();
        let _second = mutex.lock();
    }

    #[test]
    fn test_order_violation_is_reported() {
        let queue = Mutex::ranked(lock_order::QUEUE, "queue", ());
        let registry = Mutex::ranked(lock_order::REGISTRY, "registry", ());

        let _q = queue.lock();
        match registry.checked_lock() {
            Err(LockError::OrderViolation { name, held, requested }) => {
                assert_eq!(name, "registry");
                assert_eq!(held, queue.key());
                assert_eq!(requested, registry.key());
            }
            other => panic!("expected order violation, got {:?}", other.map(|_| ())),
        };
    }

    #[test]
    fn test_ascending_order_is_allowed() {
        let registry = Mutex::ranked(lock_order::REGISTRY, "registry", 1);
        let queue = Mutex::ranked(lock_order::QUEUE, "queue", 2);

        let r = registry.lock();
        let q = queue.checked_lock().expect("ascending acquisition");
        assert_eq!(*r + *q, 3);
    }

    #[test]
    fn test_out_of_order_release_keeps_tracking() {
        let a = Mutex::new(());
        let b = Mutex::new(());
        let ga = a.lock();
        let gb = b.lock();
        drop(ga);
        drop(gb);
        // nothing held anymore, so the lower key is acquirable again
        let _ga = a.checked_lock().expect("released");
    }

    #[test]
    fn test_lock_pair_orders_by_key() {
        let first = Arc::new(Mutex::ranked(lock_order::QUEUE, "first", 0u32));
        let second = Arc::new(Mutex::ranked(lock_order::QUEUE, "second", 0u32));

        let mut handles = vec![];
        for i in 0..8 {
            let first = Arc::clone(&first);
            let second = Arc::clone(&second);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    // alternate argument order; lock_pair must still not deadlock
                    if i % 2 == 0 {
                        let (mut a, mut b) = lock_pair(&*first, &*second);
                        *a += 1;
                        *b += 1;
                    } else {
                        let (mut b, mut a) = lock_pair(&*second, &*first);
                        *a += 1;
                        *b += 1;
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*first.lock(), 1600);
        assert_eq!(*second.lock(), 1600);
    }

    #[test]
    fn test_reentrant_mutex_allows_nesting() {
        let mutex = ReentrantMutex::new(7);
        let outer = mutex.lock();
        let inner = mutex.lock();
        assert_eq!(*outer + *inner, 14);
    }
}
