//! Fiber-aware mutex.
//!
//! A three-state futex word: 0 unlocked, 1 locked with no waiters, 2 locked
//! with (possible) waiters. The fast path is one compare-exchange; the slow
//! path spins briefly, then parks on the internal butex. Unlock stores 0
//! and wakes one waiter only when the word said someone might be parked.
//!
//! Blocking on a mutex is not a cancellation point: a stopped fiber still
//! acquires the lock (the wait ignores the stop shortcut), mirroring
//! pthread_mutex_lock.

use core::sync::atomic::Ordering;

use weft_abi::Errno;
use weft_lib::DueTime;

use super::butex::{Butex, butex_wait_opts, butex_wake};

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const CONTENDED: i32 = 2;

/// Try a few cheap spins before parking; contention is often momentary.
const SPIN_ATTEMPTS: usize = 4;

pub struct FiberMutex {
    butex: Butex,
}

impl FiberMutex {
    pub const fn new() -> Self {
        Self {
            butex: Butex::new(UNLOCKED),
        }
    }

    /// The internal butex; condition variables requeue waiters onto it.
    #[inline]
    pub(crate) fn internal_butex(&self) -> &Butex {
        &self.butex
    }

    /// Acquire without blocking. `WouldBlock` when the lock is held.
    pub fn try_lock(&self) -> Result<(), Errno> {
        self.butex
            .value()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| Errno::WouldBlock)
    }

    pub fn lock(&self) {
        if self.try_lock().is_ok() {
            return;
        }
        // Untimed acquisition cannot fail.
        let _ = self.lock_contended(None);
    }

    /// Acquire, giving up at `due`. `TimedOut` leaves the mutex untouched.
    pub fn timed_lock(&self, due: DueTime) -> Result<(), Errno> {
        if self.try_lock().is_ok() {
            return Ok(());
        }
        self.lock_contended(Some(due))
    }

    pub(crate) fn lock_contended(&self, due: Option<DueTime>) -> Result<(), Errno> {
        let word = self.butex.value();
        for _ in 0..SPIN_ATTEMPTS {
            if word
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        // Announce a waiter, then park until the word changes.
        while word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            match butex_wait_opts(&self.butex, CONTENDED, due, true) {
                Err(Errno::TimedOut) => return Err(Errno::TimedOut),
                // Woken, value mismatch, or spurious interrupt: retake the
                // word either way.
                _ => {}
            }
        }
        Ok(())
    }

    pub fn unlock(&self) {
        let prev = self.butex.value().swap(UNLOCKED, Ordering::Release);
        match prev {
            LOCKED => {}
            CONTENDED => {
                butex_wake(&self.butex);
            }
            _ => {
                log::error!("unlock of an unlocked fiber mutex");
                debug_assert!(false, "unlock of an unlocked fiber mutex");
            }
        }
    }

    /// RAII acquisition for plain critical sections.
    pub fn lock_guard(&self) -> FiberMutexGuard<'_> {
        self.lock();
        FiberMutexGuard { mutex: self }
    }
}

impl Default for FiberMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FiberMutexGuard<'a> {
    mutex: &'a FiberMutex,
}

impl Drop for FiberMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
