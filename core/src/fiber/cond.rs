//! Condition variable over a butex sequence counter.
//!
//! `wait` snapshots the sequence, releases the mutex and sleeps until the
//! sequence moves. `signal` bumps and wakes one. `broadcast` bumps and
//! *requeues*: one waiter wakes, the rest migrate onto the mutex's internal
//! butex and wake one at a time as the lock is released, so a broadcast
//! over N waiters costs one wake instead of an N-way stampede on the mutex.
//!
//! An interrupted or mismatched wait surfaces as a spurious wakeup: the
//! mutex is re-acquired and the caller re-checks its predicate, which it
//! must do in a loop anyway.

use core::sync::atomic::{AtomicPtr, Ordering};

use weft_abi::Errno;
use weft_lib::DueTime;

use super::butex::{Butex, butex_requeue, butex_wait, butex_wake};
use super::mutex::FiberMutex;

pub struct FiberCond {
    /// The mutex this cond is bound to, set by the first wait. Waiting with
    /// a different mutex afterwards is an error.
    mutex: AtomicPtr<FiberMutex>,
    seq: Butex,
}

impl FiberCond {
    pub const fn new() -> Self {
        Self {
            mutex: AtomicPtr::new(core::ptr::null_mut()),
            seq: Butex::new(0),
        }
    }

    fn bind(&self, mutex: &FiberMutex) -> Result<(), Errno> {
        let mp = mutex as *const FiberMutex as *mut FiberMutex;
        let bound = self.mutex.load(Ordering::Relaxed);
        if bound == mp {
            return Ok(());
        }
        self.mutex
            .compare_exchange(
                core::ptr::null_mut(),
                mp,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(|_| Errno::InvalidArgument)
    }

    fn wait_inner(&self, mutex: &FiberMutex, due: Option<DueTime>) -> Result<(), Errno> {
        let expected = self.seq.value().load(Ordering::Relaxed);
        self.bind(mutex)?;
        mutex.unlock();
        let rc = match butex_wait(&self.seq, expected, due) {
            // Spurious by design; see the module docs.
            Ok(()) | Err(Errno::WouldBlock) | Err(Errno::Interrupted) => Ok(()),
            Err(err) => Err(err),
        };
        // The mutex is re-acquired on every exit path, even after errors.
        mutex.lock_contended(None)?;
        rc
    }

    /// Release `mutex`, sleep until signaled, re-acquire `mutex`.
    ///
    /// The caller must hold `mutex` and must re-check its predicate in a
    /// loop: wake-ups may be spurious.
    pub fn wait(&self, mutex: &FiberMutex) -> Result<(), Errno> {
        self.wait_inner(mutex, None)
    }

    /// Like `wait`, but gives up at `due` with `TimedOut`. The mutex is
    /// held again when this returns, timeout included.
    pub fn timed_wait(&self, mutex: &FiberMutex, due: DueTime) -> Result<(), Errno> {
        self.wait_inner(mutex, Some(due))
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        self.seq.value().fetch_add(1, Ordering::Release);
        butex_wake(&self.seq);
    }

    /// Wake one waiter and move the rest onto the bound mutex.
    pub fn broadcast(&self) {
        let mutex = self.mutex.load(Ordering::Relaxed);
        self.seq.value().fetch_add(1, Ordering::Release);
        if mutex.is_null() {
            // Nobody ever waited; nothing can be queued.
            return;
        }
        // SAFETY: the bound mutex must outlive the cond, per the API
        // contract (same rule pthread imposes).
        let mutex = unsafe { &*mutex };
        butex_requeue(&self.seq, mutex.internal_butex());
    }
}

impl Default for FiberCond {
    fn default() -> Self {
        Self::new()
    }
}
