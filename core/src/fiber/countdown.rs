//! Countdown event: N signals release all waiters.

use core::sync::atomic::Ordering;

use weft_abi::Errno;
use weft_lib::DueTime;

use super::butex::{Butex, butex_wait, butex_wake_all};

pub struct CountdownEvent {
    butex: Butex,
    /// Guards against `add_count` after the first wait, which would race
    /// with waiters re-reading the counter.
    wait_was_invoked: core::sync::atomic::AtomicBool,
}

impl CountdownEvent {
    pub fn new(initial_count: i32) -> Self {
        assert!(initial_count >= 0, "invalid initial_count={}", initial_count);
        Self {
            butex: Butex::new(initial_count),
            wait_was_invoked: core::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Decrement by `sig`; when the counter reaches zero all waiters wake.
    /// With `flush` the batched wake-ups are published immediately.
    pub fn signal(&self, sig: i32, flush: bool) {
        let prev = self.butex.value().fetch_sub(sig, Ordering::Release);
        if prev > sig {
            return;
        }
        if prev < sig {
            log::error!("countdown over-decreased: prev={} sig={}", prev, sig);
        }
        butex_wake_all(&self.butex, flush);
    }

    fn wait_inner(&self, due: Option<DueTime>) -> Result<(), Errno> {
        self.wait_was_invoked.store(true, Ordering::Release);
        loop {
            let seen = self.butex.value().load(Ordering::Acquire);
            if seen <= 0 {
                return Ok(());
            }
            match butex_wait(&self.butex, seen, due) {
                // Value moved or spurious wake: reload and re-decide.
                Ok(()) | Err(Errno::WouldBlock) | Err(Errno::Interrupted) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Block until the counter reaches zero. Returns immediately when it
    /// already has.
    pub fn wait(&self) -> Result<(), Errno> {
        self.wait_inner(None)
    }

    /// `wait` with an absolute deadline.
    pub fn timed_wait(&self, due: DueTime) -> Result<(), Errno> {
        self.wait_inner(Some(due))
    }

    /// Raise the counter. Only legal before any wait.
    pub fn add_count(&self, v: i32) {
        if v <= 0 {
            log::error!("invalid add_count({})", v);
            return;
        }
        if self.wait_was_invoked.load(Ordering::Acquire) {
            log::error!("add_count() after wait() started; use reset() instead");
        }
        self.butex.value().fetch_add(v, Ordering::Release);
    }

    /// Restore the counter for reuse. Must not race with blocked waiters.
    pub fn reset(&self, v: i32) {
        if v < 0 {
            log::error!("invalid reset({})", v);
            return;
        }
        let prev = self.butex.value().swap(v, Ordering::Release);
        if self.wait_was_invoked.load(Ordering::Acquire) && prev != 0 {
            log::error!("reset() while count={}", prev);
        }
        self.wait_was_invoked
            .store(false, Ordering::Release);
    }

    /// Current counter value, for diagnostics.
    pub fn count(&self) -> i32 {
        self.butex.value().load(Ordering::Acquire)
    }
}
