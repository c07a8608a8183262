//! Thread synchronization primitives for the sync tiers.
//!
//! Both primitives spin: workers only ever wait for peers that are actively
//! finishing the same epoch, so the wait is short by construction.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Reusable N-party barrier with a monotonically incrementing generation.
///
/// The generation counter advances once per completed wait cycle, which
/// makes cross-epoch reuse observable: a RANK epoch moves the sync
/// manager's barrier forward by exactly four generations, a THREAD epoch
/// by none.
///
/// A participant that fails fatally must [`abort`](Barrier::abort) the
/// barrier before unwinding so peers parked in [`wait`](Barrier::wait)
/// unwind as well instead of spinning on a generation that will never come.
#[derive(Debug)]
pub struct Barrier {
    parties: usize,
    arrived: AtomicUsize,
    generation: AtomicU64,
    poisoned: AtomicBool,
}

impl Barrier {
    /// Creates a barrier for `parties` participants.
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "barrier needs at least one party");
        Self {
            parties,
            arrived: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Blocks until all parties have arrived, then releases them together.
    ///
    /// Panics if the barrier was aborted by a failed participant.
    pub fn wait(&self) {
        self.check_poison();
        let generation = self.generation.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.parties {
            // Last arrival: reset the count before releasing the waiters so
            // the barrier is reusable the instant the generation advances.
            self.arrived.store(0, Ordering::Release);
            self.generation.fetch_add(1, Ordering::AcqRel);
        } else {
            while self.generation.load(Ordering::Acquire) == generation {
                self.check_poison();
                std::hint::spin_loop();
            }
        }
    }

    /// Marks the barrier unusable; all current and future waiters panic.
    pub fn abort(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    /// Completed wait cycles since construction.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of participants.
    pub fn parties(&self) -> usize {
        self.parties
    }

    fn check_poison(&self) {
        if self.poisoned.load(Ordering::Acquire) {
            panic!("barrier aborted by a failed participant");
        }
    }
}

/// A spinning mutual-exclusion lock.
///
/// Guards the termination detector's sharded counters; hold times are a few
/// arithmetic operations, far below the cost of parking a thread.
#[derive(Debug, Default)]
pub struct Spinlock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// The lock hands out at most one guard at a time.
unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Creates a new spinlock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is free.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinlockGuard { lock: self };
            }
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }
}

/// RAII guard returned by [`Spinlock::lock`].
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_single_party_barrier_never_blocks() {
        let barrier = Barrier::new(1);
        for expected in 1..=5 {
            barrier.wait();
            assert_eq!(barrier.generation(), expected);
        }
    }

    #[test]
    fn test_barrier_releases_all_parties() {
        let barrier = Arc::new(Barrier::new(4));
        let counter = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let barrier = Arc::clone(&barrier);
                let counter = Arc::clone(&counter);
                scope.spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    barrier.wait();
                    // Everyone arrived before anyone was released.
                    assert_eq!(counter.load(Ordering::SeqCst), 4);
                });
            }
        });
        assert_eq!(barrier.generation(), 1);
    }

    #[test]
    fn test_barrier_is_reusable() {
        let barrier = Arc::new(Barrier::new(2));
        std::thread::scope(|scope| {
            for _ in 0..2 {
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || {
                    for _ in 0..100 {
                        barrier.wait();
                    }
                });
            }
        });
        assert_eq!(barrier.generation(), 100);
    }

    #[test]
    #[should_panic(expected = "aborted")]
    fn test_aborted_barrier_panics() {
        let barrier = Barrier::new(2);
        barrier.abort();
        barrier.wait();
    }

    #[test]
    fn test_spinlock_mutual_exclusion() {
        let lock = Arc::new(Spinlock::new(0u64));
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let lock = Arc::clone(&lock);
                scope.spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*lock.lock(), 40_000);
    }
}
