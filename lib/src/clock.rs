//! Clock helpers.
//!
//! All timed waits in the runtime take absolute wall-clock deadlines, the
//! way the futex-style primitives expect them. Monotonic time is used only
//! for elapsed-time measurements.

use core::time::Duration;

#[inline]
fn clock_ns(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer; both clock ids are always available
    // on the supported platforms.
    unsafe {
        libc::clock_gettime(clock, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// Nanoseconds on CLOCK_REALTIME.
#[inline]
pub fn realtime_ns() -> u64 {
    clock_ns(libc::CLOCK_REALTIME)
}

/// Nanoseconds on CLOCK_MONOTONIC.
#[inline]
pub fn monotonic_ns() -> u64 {
    clock_ns(libc::CLOCK_MONOTONIC)
}

/// An absolute wall-clock deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DueTime(u64);

impl DueTime {
    #[inline]
    pub fn after(d: Duration) -> Self {
        Self(realtime_ns().saturating_add(d.as_nanos() as u64))
    }

    #[inline]
    pub const fn from_ns(ns: u64) -> Self {
        Self(ns)
    }

    #[inline]
    pub const fn as_ns(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn has_passed(self) -> bool {
        realtime_ns() >= self.0
    }

    /// Time left until the deadline, `None` once it has passed.
    #[inline]
    pub fn remaining(self) -> Option<Duration> {
        let now = realtime_ns();
        if now >= self.0 {
            None
        } else {
            Some(Duration::from_nanos(self.0 - now))
        }
    }
}
