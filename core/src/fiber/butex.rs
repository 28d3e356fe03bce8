//! Butex: an address-based wait/wake primitive, like a futex that
//! understands fibers.
//!
//! A butex is a 32-bit value plus a waiter list. `butex_wait` suspends the
//! caller only if the value still equals the expected snapshot, closing the
//! check-then-sleep race the same way the kernel futex does. Waiters are
//! intrusive nodes living on the waiting stack, so the hot path allocates
//! nothing.
//!
//! Fiber callers are suspended through their TaskGroup; the enqueue happens
//! in a deferred callback that runs after the fiber's registers are saved,
//! so a concurrent waker can never resurrect a half-saved context. Plain OS
//! threads (including the timer thread) block on a condvar embedded in
//! their waiter node instead.
//!
//! Lock order is always butex list -> TaskMeta waiter lock. Paths that only
//! know the TaskMeta (interrupt, wait timeout) take the meta lock first and
//! then try-lock the list, retrying on contention, so the two orders cannot
//! deadlock.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicU8, AtomicU64, Ordering};

use spin::Mutex as SpinMutex;
use std::sync::{Condvar, Mutex, MutexGuard};

use weft_abi::{Errno, FiberId, FiberState};
use weft_lib::DueTime;

use super::task_group::{self, TaskGroup};
use super::task_meta::{TaskMeta, address_meta};
use super::timer;

// --- Waiter bookkeeping ---

const WAIT_PENDING: u8 = 0;
const WAIT_WOKEN: u8 = 1;
const WAIT_UNMATCHED: u8 = 2;
const WAIT_TIMEDOUT: u8 = 3;
const WAIT_INTERRUPTED: u8 = 4;

#[inline]
fn map_wait_status(status: u8) -> Result<(), Errno> {
    match status {
        WAIT_WOKEN => Ok(()),
        WAIT_UNMATCHED => Err(Errno::WouldBlock),
        WAIT_TIMEDOUT => Err(Errno::TimedOut),
        _ => Err(Errno::Interrupted),
    }
}

/// Condvar parking space for waiters that are not fibers.
struct ThreadParker {
    mutex: Mutex<()>,
    cond: Condvar,
}

impl ThreadParker {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum WaiterKind {
    Fiber {
        meta: &'static TaskMeta,
        tid: FiberId,
        /// Pending TimerThread token for timed waits; consumed exactly once.
        timer_token: AtomicU64,
    },
    Thread { parker: ThreadParker },
}

/// Intrusive waiter node; lives on the waiting fiber's or thread's stack.
pub(crate) struct ButexWaiter {
    prev: *mut ButexWaiter,
    next: *mut ButexWaiter,
    /// The butex whose list currently holds this node (requeue moves it).
    /// Null once the node has been unlinked.
    queued_on: AtomicPtr<Butex>,
    status: AtomicU8,
    expected: i32,
    kind: WaiterKind,
}

impl ButexWaiter {
    fn for_fiber(meta: &'static TaskMeta, tid: FiberId, expected: i32) -> Self {
        Self {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            queued_on: AtomicPtr::new(ptr::null_mut()),
            status: AtomicU8::new(WAIT_PENDING),
            expected,
            kind: WaiterKind::Fiber {
                meta,
                tid,
                timer_token: AtomicU64::new(0),
            },
        }
    }

    fn for_thread(expected: i32) -> Self {
        Self {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            queued_on: AtomicPtr::new(ptr::null_mut()),
            status: AtomicU8::new(WAIT_PENDING),
            expected,
            kind: WaiterKind::Thread {
                parker: ThreadParker::new(),
            },
        }
    }
}

// --- The waiter list ---

struct WaiterList {
    head: *mut ButexWaiter,
    tail: *mut ButexWaiter,
    len: usize,
}

// SAFETY: raw links are only touched under the owning butex's spin lock.
unsafe impl Send for WaiterList {}

impl WaiterList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    unsafe fn push_back(&mut self, node: *mut ButexWaiter, owner: *const Butex) {
        unsafe {
            (*node).prev = self.tail;
            (*node).next = ptr::null_mut();
            if self.tail.is_null() {
                self.head = node;
            } else {
                (*self.tail).next = node;
            }
            self.tail = node;
            (*node).queued_on.store(owner as *mut Butex, Ordering::Release);
        }
        self.len += 1;
    }

    unsafe fn pop_front(&mut self) -> *mut ButexWaiter {
        let node = self.head;
        if !node.is_null() {
            unsafe { self.unlink(node) };
        }
        node
    }

    unsafe fn unlink(&mut self, node: *mut ButexWaiter) {
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
            (*node).prev = ptr::null_mut();
            (*node).next = ptr::null_mut();
            (*node).queued_on.store(ptr::null_mut(), Ordering::Release);
        }
        self.len -= 1;
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// --- Butex ---

pub struct Butex {
    value: AtomicI32,
    waiters: SpinMutex<WaiterList>,
}

unsafe impl Send for Butex {}
unsafe impl Sync for Butex {}

impl Butex {
    pub const fn new(initial: i32) -> Self {
        Self {
            value: AtomicI32::new(initial),
            waiters: SpinMutex::new(WaiterList::new()),
        }
    }

    /// The user-visible word. By contract it is always updated *before*
    /// waking, with release ordering, so a waiter observing a stale value
    /// re-sleeps correctly.
    #[inline]
    pub fn value(&self) -> &AtomicI32 {
        &self.value
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.lock().is_empty()
    }

    /// Momentary queue length; only meaningful for tests and diagnostics.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len
    }
}

impl Default for Butex {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Drop for Butex {
    fn drop(&mut self) {
        if !self.waiters.get_mut().is_empty() {
            // Destroying a butex with live waiters is a caller bug; the
            // waiters now hold dangling list links.
            log::error!("butex dropped with waiters still queued");
            debug_assert!(false, "butex dropped with waiters still queued");
        }
    }
}

// --- wait ---

struct WaitArgs {
    waiter: *mut ButexWaiter,
    butex: *const Butex,
    due: Option<DueTime>,
}

/// Wait until the butex is woken, as long as its value still equals
/// `expected` at enqueue time.
///
/// Returns `WouldBlock` without suspending on a value mismatch,
/// `Interrupted` if the calling fiber is stopped or gets interrupted, and
/// `TimedOut` when `due` expires (also without suspending if it already
/// passed). Spurious wake-ups are possible; callers loop on their predicate.
pub fn butex_wait(butex: &Butex, expected: i32, due: Option<DueTime>) -> Result<(), Errno> {
    butex_wait_opts(butex, expected, due, false)
}

/// `butex_wait` with the stop shortcut made optional. Waits that are not
/// cancellation points (join, mutex reacquisition) pass `ignore_stop` so a
/// stopped fiber still blocks instead of spinning on EINTR.
pub(crate) fn butex_wait_opts(
    butex: &Butex,
    expected: i32,
    due: Option<DueTime>,
    ignore_stop: bool,
) -> Result<(), Errno> {
    if butex.value.load(Ordering::Acquire) != expected {
        return Err(Errno::WouldBlock);
    }
    let g = task_group::tls_task_group();
    if !g.is_null() && !unsafe { (*g).is_current_pthread_task() } {
        unsafe { wait_from_fiber(g, butex, expected, due, ignore_stop) }
    } else {
        wait_from_thread(butex, expected, due)
    }
}

unsafe fn wait_from_fiber(
    g: *mut TaskGroup,
    butex: &Butex,
    expected: i32,
    due: Option<DueTime>,
    ignore_stop: bool,
) -> Result<(), Errno> {
    let meta = unsafe { (*g).cur_meta() };
    if meta.is_stopped() && !ignore_stop {
        return Err(Errno::Interrupted);
    }
    if let Some(d) = due {
        if d.has_passed() {
            return Err(Errno::TimedOut);
        }
    }

    let mut waiter = ButexWaiter::for_fiber(meta, meta.tid(), expected);
    let mut args = WaitArgs {
        waiter: &mut waiter,
        butex,
        due,
    };
    meta.set_state(FiberState::Suspended);
    unsafe {
        (*g).set_remained(finish_butex_wait, &mut args as *mut WaitArgs as *mut c_void);
        let mut gp = g;
        task_group::sched(&mut gp);
    }

    // Resumed: tidy up a still-armed timer and report what happened. The
    // unschedule is a no-op for tokens that already fired.
    if let WaiterKind::Fiber { timer_token, .. } = &waiter.kind {
        let token = timer_token.swap(0, Ordering::AcqRel);
        if token != 0 {
            timer::global_timer_thread().unschedule(token);
        }
    }
    map_wait_status(waiter.status.load(Ordering::Acquire))
}

/// Runs on the next execution context, after the waiter's registers are
/// fully saved. Only now is it safe to publish the waiter to wakers.
fn finish_butex_wait(arg: *mut c_void) {
    let args = unsafe { &mut *(arg as *mut WaitArgs) };
    let butex = unsafe { &*args.butex };
    let waiter = args.waiter;
    let (meta, tid) = match unsafe { &(*waiter).kind } {
        WaiterKind::Fiber { meta, tid, .. } => (*meta, *tid),
        WaiterKind::Thread { .. } => unreachable!("thread waiter on fiber path"),
    };

    let mut list = butex.waiters.lock();
    if butex.value.load(Ordering::Acquire) != unsafe { (*waiter).expected } {
        unsafe { (*waiter).status.store(WAIT_UNMATCHED, Ordering::Release) };
        drop(list);
        task_group::schedule_ready(meta, tid, false);
        return;
    }
    if meta.take_interrupted() {
        unsafe { (*waiter).status.store(WAIT_INTERRUPTED, Ordering::Release) };
        drop(list);
        task_group::schedule_ready(meta, tid, false);
        return;
    }

    unsafe {
        list.push_back(waiter, butex);
    }
    {
        let _wl = meta.waiter_lock().lock();
        meta.set_current_waiter(waiter);
    }
    // Arm the timer while the list lock still pins the waiter; once the
    // lock drops, a waker may free the node at any instant.
    if let Some(d) = args.due {
        match timer::global_timer_thread().schedule(d, Box::new(move || on_wait_timeout(tid))) {
            Ok(token) => {
                if let WaiterKind::Fiber { timer_token, .. } = unsafe { &(*waiter).kind } {
                    timer_token.store(token, Ordering::Release);
                }
            }
            Err(err) => {
                // Timer unavailable (runtime stopping): degrade to an
                // untimed wait rather than losing the wakeup.
                log::warn!("timed butex_wait without timer thread: {}", err);
            }
        }
    }
    drop(list);
}

fn on_wait_timeout(tid: FiberId) {
    if let Some(meta) = address_meta(tid) {
        interrupt_wait(meta, tid, WAIT_TIMEDOUT);
    }
}

/// Detach `meta`'s in-flight butex waiter, if any, posting `status` and
/// rescheduling the fiber. Returns false when the fiber was not waiting on
/// a butex.
///
/// Invariant making the raw deref safe: `current_waiter` is cleared (under
/// the meta's waiter lock) before the owning fiber can resume, so a non-null
/// pointer observed under that lock is alive.
pub(crate) fn interrupt_wait(meta: &'static TaskMeta, tid: FiberId, status: u8) -> bool {
    loop {
        let wl = meta.waiter_lock().lock();
        let waiter = meta.current_waiter();
        if waiter.is_null() {
            return false;
        }
        let butex = unsafe { (*waiter).queued_on.load(Ordering::Acquire) };
        if butex.is_null() {
            // Being unlinked by a waker right now; it will clear
            // current_waiter shortly.
            drop(wl);
            core::hint::spin_loop();
            continue;
        }
        if let Some(mut list) = unsafe { (*butex).waiters.try_lock() } {
            // Re-check under the list lock: a requeue may have moved the
            // node between our two loads.
            if unsafe { (*waiter).queued_on.load(Ordering::Acquire) } == butex {
                unsafe {
                    list.unlink(waiter);
                    (*waiter).status.store(status, Ordering::Release);
                }
                meta.set_current_waiter(ptr::null_mut());
                drop(list);
                drop(wl);
                task_group::schedule_ready(meta, tid, false);
                return true;
            }
        }
        drop(wl);
        core::hint::spin_loop();
    }
}

pub(crate) const WAIT_STATUS_INTERRUPTED: u8 = WAIT_INTERRUPTED;

fn wait_from_thread(butex: &Butex, expected: i32, due: Option<DueTime>) -> Result<(), Errno> {
    if let Some(d) = due {
        if d.has_passed() {
            return Err(Errno::TimedOut);
        }
    }
    let mut waiter = ButexWaiter::for_thread(expected);
    let node: *mut ButexWaiter = &mut waiter;
    {
        let mut list = butex.waiters.lock();
        if butex.value.load(Ordering::Acquire) != expected {
            return Err(Errno::WouldBlock);
        }
        unsafe {
            list.push_back(node, butex);
        }
    }

    // All further accesses go through `node`: wakers mutate the links
    // through the same pointer while we are queued.
    let parker = match unsafe { &(*node).kind } {
        WaiterKind::Thread { parker } => parker,
        WaiterKind::Fiber { .. } => unreachable!(),
    };
    let mut guard = parker.lock();
    loop {
        let status = unsafe { (*node).status.load(Ordering::Acquire) };
        if status != WAIT_PENDING {
            return map_wait_status(status);
        }
        match due {
            None => {
                guard = parker
                    .cond
                    .wait(guard)
                    .unwrap_or_else(|e| e.into_inner());
            }
            Some(d) => match d.remaining() {
                Some(rem) => {
                    guard = parker
                        .cond
                        .wait_timeout(guard, rem)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
                None => {
                    // Deadline passed: pull ourselves off whichever list we
                    // are on, losing gracefully to concurrent wakers.
                    drop(guard);
                    let removed = remove_thread_waiter(node);
                    guard = parker.lock();
                    if removed {
                        unsafe {
                            (*node).status.store(WAIT_TIMEDOUT, Ordering::Release);
                        }
                    }
                    // If not removed, a waker owns the node and will set the
                    // status momentarily; loop and wait for it.
                }
            },
        }
    }
}

/// Unlink a thread waiter from its current butex. Returns false if a waker
/// got there first (the node is no longer queued anywhere).
fn remove_thread_waiter(node: *mut ButexWaiter) -> bool {
    loop {
        let butex = unsafe { (*node).queued_on.load(Ordering::Acquire) };
        if butex.is_null() {
            return false;
        }
        let mut list = unsafe { (*butex).waiters.lock() };
        if unsafe { (*node).queued_on.load(Ordering::Acquire) } == butex {
            unsafe { list.unlink(node) };
            return true;
        }
        // Requeued while we were acquiring; chase the new owner.
    }
}

// --- wake ---

enum WokenWaiter {
    Fiber(&'static TaskMeta, FiberId),
    Thread(*mut ButexWaiter),
}

/// Detach one waiter under the list lock and stamp its status. The node
/// must not be touched again after this except through the returned handle.
unsafe fn claim_woken(waiter: *mut ButexWaiter) -> WokenWaiter {
    match unsafe { &(*waiter).kind } {
        WaiterKind::Fiber { meta, tid, .. } => {
            let _wl = meta.waiter_lock().lock();
            meta.set_current_waiter(ptr::null_mut());
            unsafe { (*waiter).status.store(WAIT_WOKEN, Ordering::Release) };
            WokenWaiter::Fiber(meta, *tid)
        }
        WaiterKind::Thread { .. } => WokenWaiter::Thread(waiter),
    }
}

fn dispatch_woken(woken: WokenWaiter, nosignal: bool) {
    match woken {
        WokenWaiter::Thread(node) => unsafe {
            let WaiterKind::Thread { parker } = &(*node).kind else {
                unreachable!();
            };
            // Status is set and notify issued under the parker mutex so the
            // waiter cannot observe-and-free between the two.
            let _guard = parker.lock();
            (*node).status.store(WAIT_WOKEN, Ordering::Release);
            parker.cond.notify_one();
        },
        WokenWaiter::Fiber(meta, tid) => {
            task_group::schedule_ready(meta, tid, nosignal);
        }
    }
}

/// Wake at most one waiter. Returns the number woken (0 or 1).
///
/// When called from a fiber, the woken fiber may be switched to directly
/// (the caller is pushed to the local run queue), which is the lowest
/// latency handoff the scheduler has.
pub fn butex_wake(butex: &Butex) -> usize {
    let woken;
    {
        let mut list = butex.waiters.lock();
        let node = unsafe { list.pop_front() };
        if node.is_null() {
            return 0;
        }
        woken = unsafe { claim_woken(node) };
    }
    match woken {
        WokenWaiter::Thread(_) => dispatch_woken(woken, false),
        WokenWaiter::Fiber(meta, tid) => unsafe {
            task_group::exchange_or_ready(meta, tid);
        },
    }
    1
}

/// Wake every waiter. With `flush` the batched wake-ups are published to
/// other workers immediately; without it the caller promises to flush soon
/// (it is about to do something better, like requeue or more signals).
pub fn butex_wake_all(butex: &Butex, flush: bool) -> usize {
    let mut fibers = Vec::new();
    let mut threads = Vec::new();
    {
        let mut list = butex.waiters.lock();
        loop {
            let node = unsafe { list.pop_front() };
            if node.is_null() {
                break;
            }
            match unsafe { claim_woken(node) } {
                w @ WokenWaiter::Fiber(..) => fibers.push(w),
                w @ WokenWaiter::Thread(..) => threads.push(w),
            }
        }
    }
    let n = fibers.len() + threads.len();
    for w in threads {
        dispatch_woken(w, false);
    }
    let batched = !fibers.is_empty();
    for w in fibers {
        dispatch_woken(w, true);
    }
    if batched && flush {
        task_group::flush_current_nosignal();
    }
    n
}

/// Wake one waiter from `src` and migrate the rest to `dst` without waking
/// them. This is what keeps condvar broadcast from stampeding: the moved
/// waiters are woken one at a time as the mutex they contend on is released.
pub fn butex_requeue(src: &Butex, dst: &Butex) -> usize {
    let first;
    let mut moved = 0usize;
    {
        // Two-lock section; order by address so concurrent requeues in
        // opposite directions cannot deadlock.
        let (mut src_list, mut dst_list);
        if ptr::from_ref(src) < ptr::from_ref(dst) {
            src_list = src.waiters.lock();
            dst_list = dst.waiters.lock();
        } else {
            dst_list = dst.waiters.lock();
            src_list = src.waiters.lock();
        }
        let node = unsafe { src_list.pop_front() };
        if node.is_null() {
            return 0;
        }
        first = unsafe { claim_woken(node) };
        loop {
            let node = unsafe { src_list.pop_front() };
            if node.is_null() {
                break;
            }
            unsafe { dst_list.push_back(node, dst) };
            moved += 1;
        }
    }
    match first {
        WokenWaiter::Thread(_) => dispatch_woken(first, false),
        WokenWaiter::Fiber(meta, tid) => unsafe {
            task_group::exchange_or_ready(meta, tid);
        },
    }
    moved + 1
}
