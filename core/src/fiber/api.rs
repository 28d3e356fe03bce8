//! Public fiber operations.
//!
//! Everything here is a thin policy layer: decide whether the caller is a
//! worker fiber, a pthread-type fiber, or a plain thread, and route to the
//! scheduler primitive that fits. The heavy lifting lives in `task_group`.

use core::cell::Cell;
use core::ptr;

use std::sync::Mutex;

use weft_abi::{Errno, FiberAttr, FiberFlags, FiberId, MAX_CONCURRENCY, MIN_CONCURRENCY, TAG_DEFAULT,
               Tag};
use weft_lib::DueTime;

use super::task_control::{TaskControl, desired_concurrency, set_desired_concurrency};
use super::task_group::{self, FiberExitRequest, TaskGroup};
use super::task_meta::{FiberEntry, address_meta};
use super::timer::{TimerStatus, TimerToken, global_timer_thread};

std::thread_local! {
    /// Where this non-worker thread batches NOSIGNAL starts; remembering
    /// the group maximizes the batch and tells `fiber_flush` whom to kick.
    static NOSIGNAL_GROUP: Cell<*const TaskGroup> = const { Cell::new(ptr::null()) };
    /// Last error observed by fiber calls made off-fiber.
    static THREAD_ERRNO: Cell<i32> = const { Cell::new(0) };
}

fn note_errno(err: Errno) -> Errno {
    let g = task_group::tls_task_group();
    if !g.is_null() && !unsafe { (*g).is_current_main_task() } {
        unsafe { (*g).cur_meta().set_last_errno(err) };
    } else {
        THREAD_ERRNO.with(|cell| cell.set(err.code()));
    }
    err
}

fn noted<T>(result: Result<T, Errno>) -> Result<T, Errno> {
    result.map_err(note_errno)
}

/// The last error recorded for the calling fiber (or thread, off-fiber).
/// Separate from the C runtime errno, so library code cannot trample it.
pub fn fiber_errno() -> Option<Errno> {
    let g = task_group::tls_task_group();
    if !g.is_null() && !unsafe { (*g).is_current_main_task() } {
        unsafe { (*g).cur_meta().last_errno() }
    } else {
        THREAD_ERRNO.with(|cell| match cell.get() {
            0 => None,
            code => Errno::from_code(code),
        })
    }
}

#[inline]
fn can_run_thread_local(attr: &FiberAttr, g: &TaskGroup) -> bool {
    match attr.tag {
        None => true,
        Some(tag) => tag == g.tag(),
    }
}

fn start_from_non_worker(attr: &FiberAttr, entry: FiberEntry) -> Result<FiberId, Errno> {
    let control = TaskControl::global();
    let tag = attr.tag.unwrap_or(TAG_DEFAULT);
    if tag >= control.ntags() {
        return Err(Errno::InvalidArgument);
    }
    let group: &'static TaskGroup = if attr.flags.contains(FiberFlags::NOSIGNAL) {
        // Batch NOSIGNAL creations onto one remembered group.
        let sticky = NOSIGNAL_GROUP.with(|cell| cell.get());
        if !sticky.is_null() && unsafe { (*sticky).tag() } == tag {
            unsafe { &*sticky }
        } else {
            let group = control.choose_one_group(tag);
            NOSIGNAL_GROUP.with(|cell| cell.set(group as *const TaskGroup));
            group
        }
    } else {
        control.choose_one_group(tag)
    };
    task_group::start_from_non_worker(group, attr, tag, entry)
}

/// Start a fiber. On a worker with a compatible tag the caller yields its
/// slot to the new fiber immediately (lowest latency); everywhere else the
/// fiber is enqueued remotely and a parked worker is woken.
pub fn fiber_start<F>(attr: &FiberAttr, body: F) -> Result<FiberId, Errno>
where
    F: FnOnce() + Send + 'static,
{
    let g = task_group::tls_task_group();
    if !g.is_null() && can_run_thread_local(attr, unsafe { &*g }) {
        let mut pg = g;
        return noted(unsafe { task_group::start_foreground(&mut pg, attr, Box::new(body)) });
    }
    noted(start_from_non_worker(attr, Box::new(body)))
}

/// Start a fiber without signaling: it runs when the current worker next
/// schedules, or when somebody steals it, or after `fiber_flush`.
pub fn fiber_start_lazy<F>(attr: &FiberAttr, body: F) -> Result<FiberId, Errno>
where
    F: FnOnce() + Send + 'static,
{
    let g = task_group::tls_task_group();
    if !g.is_null() && can_run_thread_local(attr, unsafe { &*g }) {
        return noted(task_group::start_background(
            unsafe { &*g },
            attr,
            Box::new(body),
            false,
        ));
    }
    noted(start_from_non_worker(attr, Box::new(body)))
}

/// Publish every batched NOSIGNAL start made by this thread or worker.
pub fn fiber_flush() {
    let g = task_group::tls_task_group();
    if !g.is_null() {
        unsafe { (*g).flush_nosignal_tasks() };
        return;
    }
    let sticky = NOSIGNAL_GROUP.with(|cell| cell.replace(ptr::null()));
    if !sticky.is_null() {
        unsafe { (*sticky).flush_nosignal_remote() };
    }
}

/// Interrupt `tid`'s current (or next) blocking operation with EINTR.
pub fn fiber_interrupt(tid: FiberId) -> Result<(), Errno> {
    noted(task_group::interrupt(tid))
}

/// Ask `tid` to stop: raises its stop flag and interrupts its wait.
pub fn fiber_stop(tid: FiberId) -> Result<(), Errno> {
    noted(task_group::set_stopped(tid).and_then(|()| task_group::interrupt(tid)))
}

/// Whether `tid` has been asked to stop. Dead fibers count as stopped.
pub fn fiber_stopped(tid: FiberId) -> bool {
    address_meta(tid).is_none_or(|meta| meta.is_stopped())
}

/// The calling fiber's id; `FiberId::INVALID` on a plain thread or in
/// scheduler code.
pub fn fiber_self() -> FiberId {
    let g = task_group::tls_task_group();
    if !g.is_null() && !unsafe { (*g).is_current_main_task() } {
        unsafe { (*g).current_tid() }
    } else {
        FiberId::INVALID
    }
}

/// The calling worker's tag.
pub fn fiber_self_tag() -> Tag {
    let g = task_group::tls_task_group();
    if g.is_null() {
        TAG_DEFAULT
    } else {
        unsafe { (*g).tag() }
    }
}

/// Terminate the calling fiber from any call depth, by unwinding to the
/// fiber runner. On a non-fiber thread this unwinds the thread instead.
pub fn fiber_exit() -> ! {
    std::panic::panic_any(FiberExitRequest)
}

/// Wait until `tid` terminates. Joining an already-dead id succeeds
/// immediately; joining yourself is an error.
pub fn fiber_join(tid: FiberId) -> Result<(), Errno> {
    noted(task_group::join(tid))
}

pub use super::task_meta::fiber_exists;

/// The creation attributes of a live fiber.
pub fn fiber_getattr(tid: FiberId) -> Result<FiberAttr, Errno> {
    noted(address_meta(tid).map(|meta| meta.attr()).ok_or(Errno::InvalidArgument))
}

/// Suspend the calling fiber for at least `microseconds`. A non-fiber
/// caller gets a plain thread sleep. Interruption surfaces as EINTR.
pub fn fiber_usleep(microseconds: u64) -> Result<(), Errno> {
    let g = task_group::tls_task_group();
    if !g.is_null() && !unsafe { (*g).is_current_pthread_task() } {
        let mut pg = g;
        return noted(unsafe { task_group::usleep_current(&mut pg, microseconds) });
    }
    std::thread::sleep(std::time::Duration::from_micros(microseconds));
    Ok(())
}

/// Give up the worker to the next runnable fiber.
pub fn fiber_yield() {
    let g = task_group::tls_task_group();
    if !g.is_null() && !unsafe { (*g).is_current_pthread_task() } {
        let mut pg = g;
        unsafe { task_group::yield_current(&mut pg) };
        return;
    }
    // SAFETY: trivial libc call.
    unsafe {
        libc::sched_yield();
    }
}

/// Hint that the caller will finish soon, letting starts it performs skip
/// the wake-up signal. Honors `NEVER_QUIT`.
pub fn fiber_about_to_quit() -> Result<(), Errno> {
    let g = task_group::tls_task_group();
    if g.is_null() {
        return Err(note_errno(Errno::PermissionDenied));
    }
    let meta = unsafe { (*g).cur_meta() };
    if !meta.flags().contains(FiberFlags::NEVER_QUIT) {
        meta.set_about_to_quit();
    }
    Ok(())
}

// --- concurrency control ---

/// Current number of workers (the configured target before the pool runs).
pub fn fiber_getconcurrency() -> usize {
    match TaskControl::try_global() {
        Some(control) => control.concurrency(),
        None => desired_concurrency(),
    }
}

/// Set the total worker count. Growth is applied immediately when the pool
/// runs; shrinking a live pool is refused.
pub fn fiber_setconcurrency(num: usize) -> Result<(), Errno> {
    if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&num) {
        log::error!("invalid concurrency={}", num);
        return Err(note_errno(Errno::InvalidArgument));
    }
    let Some(control) = TaskControl::try_global() else {
        set_desired_concurrency(num);
        return Ok(());
    };
    let current = control.concurrency();
    if num < current {
        return Err(note_errno(Errno::PermissionDenied));
    }
    if num == current {
        return Ok(());
    }
    set_desired_concurrency(num);
    let ntags = control.ntags();
    let mut added = 0;
    for i in 0..(num - current) {
        added += control.add_workers(1, i % ntags);
    }
    if added == num - current {
        Ok(())
    } else {
        Err(note_errno(Errno::PermissionDenied))
    }
}

pub fn fiber_getconcurrency_by_tag(tag: Tag) -> Result<usize, Errno> {
    let control = TaskControl::try_global().ok_or(Errno::PermissionDenied)?;
    noted(control.concurrency_by_tag(tag))
}

/// Grow one tag's worker count. The pool-wide target still bounds the sum.
pub fn fiber_setconcurrency_by_tag(num: usize, tag: Tag) -> Result<(), Errno> {
    let control = TaskControl::try_global().ok_or(Errno::PermissionDenied)?;
    let tag_workers = control.concurrency_by_tag(tag)?;
    if num < tag_workers {
        return Err(note_errno(Errno::PermissionDenied));
    }
    let add = num - tag_workers;
    if add == 0 {
        return Ok(());
    }
    if control.concurrency() + add > desired_concurrency() {
        log::error!(
            "cannot grow tag {}: pool would exceed target concurrency {}",
            tag,
            desired_concurrency()
        );
        return Err(note_errno(Errno::PermissionDenied));
    }
    if control.add_workers(add, tag) == add {
        Ok(())
    } else {
        Err(note_errno(Errno::PermissionDenied))
    }
}

/// True when called from fiber context that can actually suspend.
pub fn is_running_on_fiber() -> bool {
    let g = task_group::tls_task_group();
    !g.is_null() && !unsafe { (*g).is_current_pthread_task() }
}

/// True on plain threads and pthread-mode fibers.
pub fn is_running_on_pthread() -> bool {
    !is_running_on_fiber()
}

// --- per-fiber local storage ---

/// Stash one word on the current fiber. No-op off-fiber.
pub fn fiber_set_local(value: usize) {
    let g = task_group::tls_task_group();
    if !g.is_null() && !unsafe { (*g).is_current_main_task() } {
        unsafe { (*g).cur_meta().set_local_storage(value) };
    }
}

/// The word stashed by `fiber_set_local`, 0 off-fiber.
pub fn fiber_get_local() -> usize {
    let g = task_group::tls_task_group();
    if !g.is_null() && !unsafe { (*g).is_current_main_task() } {
        unsafe { (*g).cur_meta().local_storage() }
    } else {
        0
    }
}

// --- timers ---

/// Run `body` at the absolute time `due` on the timer thread. The callback
/// must not block.
pub fn fiber_timer_add<F>(due: DueTime, body: F) -> Result<TimerToken, Errno>
where
    F: FnOnce() + Send + 'static,
{
    noted(global_timer_thread().schedule(due, Box::new(body)))
}

/// Cancel a timer. See `TimerStatus` for the three possible outcomes.
pub fn fiber_timer_del(token: TimerToken) -> TimerStatus {
    global_timer_thread().unschedule(token)
}

// --- pool lifecycle ---

/// Stop the whole runtime: workers finish queued fibers and exit. Fibers
/// suspended on primitives never resume; starts fail with `Stopped`.
pub fn fiber_stop_world() {
    if let Some(control) = TaskControl::try_global() {
        control.stop_and_join();
    }
}

pub use super::task_control::{set_tagged_worker_start_fn, set_worker_start_fn};

// --- fiber lists ---

/// A set of fiber ids that can be stopped and joined as a unit. Ids that
/// die on their own are tolerated everywhere.
pub struct FiberList {
    ids: Mutex<Vec<FiberId>>,
}

impl FiberList {
    pub fn new() -> Self {
        Self {
            ids: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, tid: FiberId) {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tid);
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every member to stop; dead ids are skipped silently.
    pub fn stop_all(&self) {
        let ids = self
            .ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for tid in ids {
            let _ = fiber_stop(tid);
        }
    }

    /// Join every member, then clear the list.
    pub fn join_all(&self) {
        let ids = {
            let mut guard = self.ids.lock().unwrap_or_else(|e| e.into_inner());
            core::mem::take(&mut *guard)
        };
        for tid in ids {
            let _ = fiber_join(tid);
        }
    }
}

impl Default for FiberList {
    fn default() -> Self {
        Self::new()
    }
}
