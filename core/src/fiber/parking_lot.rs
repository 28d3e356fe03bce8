//! Parking slots for idle workers.
//!
//! Each tag owns a small fixed pool of lots; a worker hashes itself onto
//! one and sleeps there when it finds no work. Signalers bump the pending
//! counter and wake sleepers. The counter's low bit is the stop flag so a
//! single word tells a waking worker everything it needs.

use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use std::sync::{Condvar, Mutex};

/// Lots per tag. Small on purpose: more lots spread wake-ups, fewer lots
/// batch them.
pub const PARKING_LOTS_PER_TAG: usize = 4;

/// Snapshot of a lot's counter taken before the final emptiness check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParkState(i32);

impl ParkState {
    #[inline]
    pub fn stopped(self) -> bool {
        self.0 & 1 != 0
    }
}

pub struct ParkingLot {
    pending: AtomicI32,
    sleepers: AtomicUsize,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl ParkingLot {
    pub fn new() -> Self {
        Self {
            pending: AtomicI32::new(0),
            sleepers: AtomicUsize::new(0),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Wake up to `num` parked workers. Returns how many could have been
    /// woken (0 when nobody was parked here).
    pub fn signal(&self, num: usize) -> usize {
        self.pending.fetch_add(2, Ordering::SeqCst);
        let guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let woken = num.min(self.sleepers.load(Ordering::Acquire));
        for _ in 0..woken {
            self.cond.notify_one();
        }
        drop(guard);
        woken
    }

    #[inline]
    pub fn get_state(&self) -> ParkState {
        ParkState(self.pending.load(Ordering::SeqCst))
    }

    /// Park until the counter moves away from `expected`. Callers re-check
    /// their work sources after every return; spurious wake-ups are fine.
    pub fn wait(&self, expected: ParkState) {
        let mut guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.sleepers.fetch_add(1, Ordering::AcqRel);
        while self.pending.load(Ordering::SeqCst) == expected.0 {
            guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        self.sleepers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Mark stopped and release every sleeper.
    pub fn stop(&self) {
        self.pending.fetch_or(1, Ordering::SeqCst);
        let guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.cond.notify_all();
        drop(guard);
    }
}

impl Default for ParkingLot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn signal_releases_waiter() {
        let lot = Arc::new(ParkingLot::new());
        let st = lot.get_state();
        let waiter = {
            let lot = lot.clone();
            std::thread::spawn(move || lot.wait(st))
        };
        // Give the waiter a moment to park, then signal.
        std::thread::sleep(Duration::from_millis(20));
        lot.signal(1);
        waiter.join().unwrap();
    }

    #[test]
    fn stale_state_returns_immediately() {
        let lot = ParkingLot::new();
        let st = lot.get_state();
        lot.signal(0);
        // State changed since the snapshot; wait must not block.
        lot.wait(st);
    }

    #[test]
    fn stop_flag_is_visible() {
        let lot = ParkingLot::new();
        assert!(!lot.get_state().stopped());
        lot.stop();
        assert!(lot.get_state().stopped());
    }
}
