//! The timer thread.
//!
//! One dedicated OS thread services every timed wait in the process. It
//! keeps a min-heap of absolute deadlines and sleeps on a butex bound to the
//! head's deadline; schedulers that move the head earlier bump the butex and
//! wake it. Since the timer thread is not a worker, its butex waits take the
//! condvar path, which conveniently has its own deadline support and no
//! dependency back on this module.
//!
//! Tokens are (slot | generation) pairs from a versioned arena, so `del` on
//! a fired or recycled token reports "not found" instead of cancelling a
//! stranger's timer. Callbacks run on the timer thread and must not block.

use core::sync::atomic::{AtomicU8, AtomicBool, Ordering};
use std::collections::BinaryHeap;
use std::sync::OnceLock;

use spin::Mutex as SpinMutex;

use weft_abi::Errno;
use weft_lib::{Arena, DueTime, realtime_ns};

use super::butex::{Butex, butex_wait, butex_wake};

/// Opaque handle of one scheduled entry. Never zero.
pub type TimerToken = u64;

const TIMER_SLOTS: usize = 65536;

const TIMER_PENDING: u8 = 0;
const TIMER_CANCELLED: u8 = 1;
const TIMER_RUNNING: u8 = 2;
const TIMER_DONE: u8 = 3;

/// Outcome of `unschedule`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerStatus {
    /// The entry was still pending and is now cancelled; its callback will
    /// never run.
    Cancelled,
    /// The callback already ran or is running right now.
    AlreadyRun,
    /// Unknown token: bad handle, double cancel, or long-recycled slot.
    NotFound,
}

type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerSlot {
    state: AtomicU8,
    callback: SpinMutex<Option<TimerCallback>>,
}

impl Default for TimerSlot {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(TIMER_PENDING),
            callback: SpinMutex::new(None),
        }
    }
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    due_ns: u64,
    index: u32,
    version: u32,
}

// BinaryHeap is a max-heap; invert the deadline comparison to pop the
// earliest entry first.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        other
            .due_ns
            .cmp(&self.due_ns)
            .then_with(|| other.index.cmp(&self.index))
            .then_with(|| other.version.cmp(&self.version))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct HeapState {
    heap: BinaryHeap<HeapEntry>,
    /// Deadline the timer thread is currently sleeping toward.
    nearest_ns: u64,
}

pub struct TimerThread {
    slots: Arena<TimerSlot>,
    state: SpinMutex<HeapState>,
    /// The thread sleeps here; schedulers bump the value and wake when the
    /// heap head moves earlier.
    nsignals: Butex,
    stopped: AtomicBool,
}

#[inline]
fn pack_token(index: u32, version: u32) -> TimerToken {
    ((version as u64) << 32) | index as u64
}

#[inline]
fn unpack_token(token: TimerToken) -> (u32, u32) {
    (token as u32, (token >> 32) as u32)
}

impl TimerThread {
    fn new() -> Self {
        Self {
            slots: Arena::with_capacity(TIMER_SLOTS),
            state: SpinMutex::new(HeapState {
                heap: BinaryHeap::new(),
                nearest_ns: u64::MAX,
            }),
            nsignals: Butex::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Insert a callback to run at `due`. The returned token cancels it.
    pub fn schedule(&self, due: DueTime, callback: TimerCallback) -> Result<TimerToken, Errno> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Errno::Stopped);
        }
        let due_ns = due.as_ns();
        // Slot claim and reset happen under the heap lock: every
        // state-transition race (schedule vs unschedule vs fire) is decided
        // while it is held, so a stale token can never hijack a recycled
        // slot.
        let (index, version, earlier) = {
            let mut state = self.state.lock();
            let Some((index, version, slot)) = self.slots.acquire() else {
                drop(state);
                log::error!("timer slot table exhausted ({} entries)", TIMER_SLOTS);
                return Err(Errno::ResourceExhausted);
            };
            let slot = slot.value();
            slot.state.store(TIMER_PENDING, Ordering::Release);
            *slot.callback.lock() = Some(callback);
            state.heap.push(HeapEntry {
                due_ns,
                index,
                version,
            });
            let earlier = if due_ns < state.nearest_ns {
                state.nearest_ns = due_ns;
                true
            } else {
                false
            };
            (index, version, earlier)
        };
        if earlier {
            // Published before the wake, as the butex contract requires.
            self.nsignals.value().fetch_add(1, Ordering::Release);
            butex_wake(&self.nsignals);
        }
        Ok(pack_token(index, version))
    }

    /// Cancel a scheduled entry. Cancellation is idempotent: only the call
    /// that actually stops the callback reports `Cancelled`.
    pub fn unschedule(&self, token: TimerToken) -> TimerStatus {
        let (index, version) = unpack_token(token);
        let _state = self.state.lock();
        let Some(slot) = self.slots.resolve(index, version) else {
            return TimerStatus::NotFound;
        };
        let slot = slot.value();
        match slot.state.compare_exchange(
            TIMER_PENDING,
            TIMER_CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // Free the callback eagerly; the heap entry is discarded
                // lazily when it surfaces.
                drop(slot.callback.lock().take());
                TimerStatus::Cancelled
            }
            Err(TIMER_CANCELLED) => TimerStatus::NotFound,
            Err(_) => TimerStatus::AlreadyRun,
        }
    }

    /// The timer thread body.
    fn run(&self) {
        log::debug!("timer thread started");
        while !self.stopped.load(Ordering::Acquire) {
            // Snapshot first: any schedule() that lands after this makes
            // the sleep below return immediately.
            let expected = self.nsignals.value().load(Ordering::Acquire);

            let mut due = Vec::new();
            let now = realtime_ns();
            let next_ns = {
                let mut state = self.state.lock();
                while state.heap.peek().is_some_and(|head| head.due_ns <= now) {
                    if let Some(entry) = state.heap.pop() {
                        due.push(entry);
                    }
                }
                let next = state.heap.peek().map_or(u64::MAX, |e| e.due_ns);
                state.nearest_ns = next;
                next
            };

            for entry in due {
                self.fire(entry);
            }

            let deadline = if next_ns == u64::MAX {
                None
            } else {
                Some(DueTime::from_ns(next_ns))
            };
            // TimedOut / WouldBlock / Woken all mean "look again".
            let _ = butex_wait(&self.nsignals, expected, deadline);
        }
        log::debug!("timer thread stopped");
    }

    fn fire(&self, entry: HeapEntry) {
        // Claim under the heap lock (see schedule); run outside it.
        let callback = {
            let _state = self.state.lock();
            let Some(slot) = self.slots.resolve(entry.index, entry.version) else {
                return;
            };
            let slot = slot.value();
            match slot.state.compare_exchange(
                TIMER_PENDING,
                TIMER_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => slot.callback.lock().take(),
                Err(_) => {
                    // Cancelled while queued; just retire the slot.
                    self.slots.release(entry.index, entry.version);
                    return;
                }
            }
        };
        if let Some(callback) = callback {
            callback();
        }
        if let Some(slot) = self.slots.resolve(entry.index, entry.version) {
            slot.value().state.store(TIMER_DONE, Ordering::Release);
        }
        self.slots.release(entry.index, entry.version);
    }

    /// Stop accepting work and wake the thread so it can exit. Pending
    /// entries never fire.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.nsignals.value().fetch_add(1, Ordering::Release);
        butex_wake(&self.nsignals);
    }
}

static GLOBAL_TIMER: OnceLock<&'static TimerThread> = OnceLock::new();

/// The process-wide timer thread, started lazily by its first client.
pub fn global_timer_thread() -> &'static TimerThread {
    GLOBAL_TIMER.get_or_init(|| {
        let timer: &'static TimerThread = Box::leak(Box::new(TimerThread::new()));
        let spawned = std::thread::Builder::new()
            .name("weft-timer".into())
            .spawn(move || timer.run());
        if spawned.is_err() {
            log::error!("failed to spawn the timer thread; timed waits will hang");
        }
        timer
    })
}
