//! Lock-free counters for metrics and id stamping.
//!
//! [`AtomicCounter`] backs pool size, active worker and queue depth gauges as
//! well as job id generation. Every operation is a single atomic instruction
//! or a load-compute-CAS retry loop, so concurrent updates are never lost.
//!
//! ```
//! use job_engine::AtomicCounter;
//!
//! let counter = AtomicCounter::new(0);
//! assert_eq!(counter.increment(), 1);
//! assert!(counter.compare_and_swap(1, 10));
//! assert!(!counter.compare_and_swap(1, 20));
//! assert_eq!(counter.load(), 10);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Linearizable unsigned counter.
///
/// Decrement saturates at zero: the counters in this crate are gauges that can
/// never legitimately go negative.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    /// Create a counter starting at `initial`.
    #[must_use]
    pub const fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    /// Add one and return the new value.
    pub fn increment(&self) -> u64 {
        self.add(1)
    }

    /// Add `n` and return the new value.
    pub fn add(&self, n: u64) -> u64 {
        self.value.fetch_add(n, Ordering::AcqRel).wrapping_add(n)
    }

    /// Subtract one (saturating at zero) and return the new value.
    pub fn decrement(&self) -> u64 {
        self.update(|v| v.saturating_sub(1))
    }

    /// Replace the value with `new` iff it currently equals `expected`.
    pub fn compare_and_swap(&self, expected: u64, new: u64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Current value.
    #[must_use]
    pub fn load(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Overwrite the value.
    pub fn store(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }

    /// Apply `f` atomically with an optimistic retry loop and return the value
    /// that was stored.
    pub fn update<F>(&self, mut f: F) -> u64
    where
        F: FnMut(u64) -> u64,
    {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let next = f(current);
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn hammer(threads: usize, per_thread: usize) -> u64 {
        let counter = Arc::new(AtomicCounter::new(0));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        counter.increment();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        counter.load()
    }

    #[test]
    fn test_increment_decrement() {
        let counter = AtomicCounter::new(5);
        assert_eq!(counter.increment(), 6);
        assert_eq!(counter.decrement(), 5);
        assert_eq!(counter.add(10), 15);
    }

    #[test]
    fn test_decrement_saturates() {
        let counter = AtomicCounter::new(0);
        assert_eq!(counter.decrement(), 0);
        assert_eq!(counter.load(), 0);
    }

    #[test]
    fn test_compare_and_swap() {
        let counter = AtomicCounter::new(3);
        assert!(!counter.compare_and_swap(2, 9));
        assert_eq!(counter.load(), 3);
        assert!(counter.compare_and_swap(3, 9));
        assert_eq!(counter.load(), 9);
    }

    #[test]
    fn test_update_loop() {
        let counter = AtomicCounter::new(4);
        assert_eq!(counter.update(|v| v * 3), 12);
    }

    #[test]
    fn test_concurrent_increments_exact() {
        for n in [1usize, 10, 1000] {
            assert_eq!(hammer(n, 1), n as u64);
        }
        assert_eq!(hammer(8, 1000), 8000);
    }

    #[test]
    fn test_concurrent_cas_loop_never_loses_updates() {
        let counter = Arc::new(AtomicCounter::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..500 {
                        loop {
                            let seen = counter.load();
                            if counter.compare_and_swap(seen, seen + 2) {
                                break;
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(), 4000);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 16,
            ..ProptestConfig::default()
        })]

        /// N concurrent increments from zero always land on exactly N.
        #[test]
        fn concurrent_increments_sum_to_n(
            n in prop::sample::select(vec![1usize, 10, 1000]),
            threads in 1usize..8
        ) {
            let counter = Arc::new(AtomicCounter::new(0));
            let per_thread = n / threads;
            let remainder = n % threads;
            let handles: Vec<_> = (0..threads)
                .map(|i| {
                    let counter = Arc::clone(&counter);
                    let count = per_thread + usize::from(i < remainder);
                    thread::spawn(move || {
                        for _ in 0..count {
                            counter.increment();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            prop_assert_eq!(counter.load(), n as u64);
        }
    }
}
