//! The per-worker scheduler.
//!
//! Each worker thread owns one `TaskGroup`: a work-stealing run queue whose
//! bottom only the owner touches, a locked remote queue for non-worker
//! producers, and the context frame of the worker's own stack (the "main
//! task") that scheduling code runs on.
//!
//! Suspension is a two-phase affair. The suspending fiber registers a
//! *remained* callback and switches away; the callback runs on the next
//! execution context, after the registers are fully saved. Everything that
//! would let another thread resume the fiber (butex enqueue, run-queue push,
//! timer arming) happens inside remained callbacks, which is what makes a
//! wake on one worker race-free against the save on another.

use core::ffi::c_void;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use weft_abi::{Errno, FiberAttr, FiberFlags, FiberId, FiberState, StackType, Tag};
use weft_lib::{DueTime, WorkerRng};

use super::butex::{self, butex_wake_all};
use super::config::config;
use super::context::switch_context;
use super::remote_queue::RemoteTaskQueue;
use super::stack::{ContextualStack, get_stack, return_stack};
use super::task_control::TaskControl;
use super::task_meta::{FiberEntry, TaskMeta, address_meta, create_meta, release_meta};
use super::timer::global_timer_thread;
use super::work_steal::WorkStealingQueue;
use super::parking_lot::ParkingLot;

/// Payload thrown by `fiber_exit`; the runner treats it as a normal return.
pub struct FiberExitRequest;

type RemainedFn = fn(*mut c_void);

std::thread_local! {
    static TLS_GROUP: core::cell::Cell<*mut TaskGroup> =
        const { core::cell::Cell::new(ptr::null_mut()) };
}

/// The calling thread's TaskGroup, null off-worker.
#[inline]
pub(crate) fn tls_task_group() -> *mut TaskGroup {
    TLS_GROUP.with(|g| g.get())
}

pub(crate) fn set_tls_task_group(g: *mut TaskGroup) {
    TLS_GROUP.with(|cell| cell.set(g));
}

pub struct TaskGroup {
    rq: WorkStealingQueue<FiberId>,
    remote_rq: RemoteTaskQueue,
    cur_meta: AtomicPtr<TaskMeta>,
    main_meta: &'static TaskMeta,
    main_tid: FiberId,
    main_stack: *mut ContextualStack,
    tag: Tag,
    worker_id: usize,
    control: &'static TaskControl,
    /// Locally queued tasks whose wake-up signal is still owed.
    nosignal: AtomicI32,
    park_lot: &'static ParkingLot,
    /// Deferred callback executed on the next context after a switch.
    /// Owner-thread only.
    remained: UnsafeCell<Option<(RemainedFn, *mut c_void)>>,
    /// Steal-partner randomness. Owner-thread only.
    rng: UnsafeCell<WorkerRng>,
}

unsafe impl Send for TaskGroup {}
unsafe impl Sync for TaskGroup {}

impl TaskGroup {
    pub(crate) fn new(
        control: &'static TaskControl,
        tag: Tag,
        worker_id: usize,
    ) -> Result<Box<Self>, Errno> {
        let cfg = config();
        let rq = WorkStealingQueue::new(cfg.runqueue_capacity)?;
        let remote_rq = RemoteTaskQueue::new(cfg.remote_queue_capacity);

        // The synthetic main task stands for the scheduling code itself; it
        // wraps the worker's pthread stack and is never joined.
        let main_attr = FiberAttr {
            stack_type: StackType::Main,
            flags: FiberFlags::empty(),
            tag: Some(tag),
        };
        let (main_tid, main_meta) = create_meta(&main_attr, tag, Box::new(|| {}))?;
        let main_stack = Box::into_raw(Box::new(ContextualStack::main_stack()));
        main_meta.set_stack(main_stack);
        main_meta.set_state(FiberState::Running);

        Ok(Box::new(Self {
            rq,
            remote_rq,
            cur_meta: AtomicPtr::new(main_meta as *const TaskMeta as *mut TaskMeta),
            main_meta,
            main_tid,
            main_stack,
            tag,
            worker_id,
            control,
            nosignal: AtomicI32::new(0),
            park_lot: control.parking_lot_for(tag, worker_id),
            remained: UnsafeCell::new(None),
            rng: UnsafeCell::new(WorkerRng::seeded(worker_id as u64)),
        }))
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    #[inline]
    pub(crate) fn cur_meta(&self) -> &'static TaskMeta {
        // SAFETY: cur_meta always points into the never-freed meta arena.
        unsafe { &*self.cur_meta.load(Ordering::Acquire) }
    }

    #[inline]
    fn set_cur_meta(&self, meta: &'static TaskMeta) {
        self.cur_meta
            .store(meta as *const TaskMeta as *mut TaskMeta, Ordering::Release);
    }

    #[inline]
    pub fn current_tid(&self) -> FiberId {
        self.cur_meta().tid()
    }

    #[inline]
    pub fn is_current_main_task(&self) -> bool {
        ptr::eq(self.cur_meta(), self.main_meta)
    }

    /// True when the running code must stay on the worker's own stack: the
    /// main task itself, or a pthread-type fiber borrowing it.
    #[inline]
    pub fn is_current_pthread_task(&self) -> bool {
        self.cur_meta().stack() == self.main_stack
    }

    #[inline]
    pub(crate) fn main_stack_ptr(&self) -> *mut ContextualStack {
        self.main_stack
    }

    /// Owner-thread only: register the callback to run right after the next
    /// context switch away from the current task.
    pub(crate) fn set_remained(&self, f: RemainedFn, arg: *mut c_void) {
        // SAFETY: owner-thread field, and at most one remained is pending
        // per switch by construction.
        unsafe {
            let slot = &mut *self.remained.get();
            debug_assert!(slot.is_none());
            *slot = Some((f, arg));
        }
    }

    fn run_remained(&self) {
        // SAFETY: owner-thread field.
        let taken = unsafe { (*self.remained.get()).take() };
        if let Some((f, arg)) = taken {
            f(arg);
        }
    }

    fn rng(&self) -> &mut WorkerRng {
        // SAFETY: owner-thread field.
        unsafe { &mut *self.rng.get() }
    }

    // --- run queue plumbing ---

    #[inline]
    pub(crate) fn rq_steal(&self) -> Option<FiberId> {
        self.rq.steal()
    }

    #[inline]
    pub(crate) fn remote_pop(&self) -> Option<FiberId> {
        self.remote_rq.pop()
    }

    pub(crate) fn rq_size_hint(&self) -> usize {
        self.rq.volatile_size()
    }

    /// Owner-thread only. Enqueue a ready fiber on the local queue, waking a
    /// parked worker unless the signal is being batched.
    pub(crate) fn ready_to_run(&self, tid: FiberId, nosignal: bool) {
        while !self.rq.push(tid) {
            // A full queue means produced-but-unsignaled work; publish it
            // and give stealers a beat to drain us.
            self.flush_nosignal_tasks();
            log::warn!(
                "worker {} run queue full (capacity {}), retrying",
                self.worker_id,
                self.rq.capacity()
            );
            std::thread::sleep(Duration::from_millis(1));
        }
        if nosignal {
            self.nosignal.fetch_add(1, Ordering::AcqRel);
        } else {
            let batch = self.nosignal.swap(0, Ordering::AcqRel) + 1;
            self.control.signal_task(batch as usize, self.tag);
        }
    }

    /// Make every locally batched NOSIGNAL task visible to other workers.
    pub(crate) fn flush_nosignal_tasks(&self) {
        let batch = self.nosignal.swap(0, Ordering::AcqRel);
        if batch > 0 {
            self.control.signal_task(batch as usize, self.tag);
        }
    }

    /// Any-thread. Enqueue on the remote queue, signaling like
    /// `ready_to_run` does.
    pub(crate) fn ready_to_run_remote(&self, tid: FiberId, nosignal: bool) {
        while !self.remote_rq.push(tid, nosignal) {
            self.flush_nosignal_remote();
            log::warn!(
                "worker {} remote queue full (capacity {}), retrying",
                self.worker_id,
                self.remote_rq.capacity()
            );
            std::thread::sleep(Duration::from_millis(1));
        }
        if !nosignal {
            let batch = self.remote_rq.take_nosignal() + 1;
            self.control.signal_task(batch, self.tag);
        }
    }

    pub(crate) fn flush_nosignal_remote(&self) {
        let batch = self.remote_rq.take_nosignal();
        if batch > 0 {
            self.control.signal_task(batch, self.tag);
        }
    }

    /// Pull runnable work: own remote queue first, then steal from
    /// partners in the same tag.
    fn steal_one(&self) -> Option<FiberId> {
        if let Some(tid) = self.remote_rq.pop() {
            return Some(tid);
        }
        self.control.steal_task(self.rng(), self.tag)
    }

    /// Park until work arrives or the pool stops. `None` means the worker
    /// should exit; queues are drained before that.
    fn wait_task(&self) -> Option<FiberId> {
        loop {
            if self.control.is_stopped() {
                // Drain whatever is still runnable, then quit.
                return self.rq.pop().or_else(|| self.steal_one());
            }
            let state = self.park_lot.get_state();
            if state.stopped() {
                continue;
            }
            if let Some(tid) = self.steal_one() {
                return Some(tid);
            }
            self.park_lot.wait(state);
        }
    }

    /// The worker thread body: schedule until told to stop.
    pub(crate) fn run_main_task(&self) {
        let self_ptr = self as *const TaskGroup as *mut TaskGroup;
        log::debug!("worker {} (tag {}) scheduling", self.worker_id, self.tag);
        while let Some(tid) = self.wait_task() {
            let mut pg = self_ptr;
            unsafe {
                sched_to(&mut pg, tid);
            }
            if !self.is_current_main_task() {
                // A pthread-type (or stack-starved) fiber was handed the
                // worker stack; run it in place.
                task_runner(true);
            }
        }
        log::debug!("worker {} (tag {}) exiting", self.worker_id, self.tag);
    }
}

// --- ready-queue handoff helpers ---

struct ReadyToRunArgs {
    tid: FiberId,
    nosignal: bool,
}

fn ready_to_run_in_worker(arg: *mut c_void) {
    let args = unsafe { &*(arg as *const ReadyToRunArgs) };
    let g = tls_task_group();
    debug_assert!(!g.is_null());
    unsafe {
        (*g).ready_to_run(args.tid, args.nosignal);
    }
}

/// Mark `tid` runnable and enqueue it near the caller: locally when the
/// calling thread is a worker of the same tag, remotely otherwise.
///
/// `nosignal` batching only applies to the local path, where the caller is
/// a worker that will flush (or schedule) soon. Remote pushes always
/// signal: nobody on the far side knows a flush is owed.
pub(crate) fn schedule_ready(meta: &'static TaskMeta, tid: FiberId, nosignal: bool) {
    meta.set_state(FiberState::Ready);
    let g = tls_task_group();
    if !g.is_null() && unsafe { (*g).tag() } == meta.tag() {
        unsafe {
            (*g).ready_to_run(tid, nosignal);
        }
    } else {
        let control = TaskControl::global();
        control
            .choose_one_group(meta.tag())
            .ready_to_run_remote(tid, false);
    }
}

/// Wake with the direct-switch fast path: the caller is parked on its own
/// run queue and the woken fiber takes over this worker immediately. Falls
/// back to a plain enqueue when the caller cannot switch (non-worker,
/// pthread task, or foreign tag).
pub(crate) unsafe fn exchange_or_ready(meta: &'static TaskMeta, tid: FiberId) {
    let g = tls_task_group();
    if g.is_null()
        || unsafe { (*g).is_current_pthread_task() }
        || unsafe { (*g).tag() } != meta.tag()
    {
        schedule_ready(meta, tid, false);
        return;
    }
    unsafe {
        let cur = (*g).cur_meta();
        let mut args = ReadyToRunArgs {
            tid: cur.tid(),
            nosignal: false,
        };
        cur.set_state(FiberState::Ready);
        (*g).set_remained(ready_to_run_in_worker, &mut args as *mut ReadyToRunArgs as *mut c_void);
        meta.set_state(FiberState::Ready);
        let mut pg = g;
        sched_to_meta(&mut pg, meta);
    }
}

/// Flush the calling worker's batched wake-ups, if it is a worker.
pub(crate) fn flush_current_nosignal() {
    let g = tls_task_group();
    if !g.is_null() {
        unsafe {
            (*g).flush_nosignal_tasks();
        }
    }
}

// --- the switch machinery ---

/// Resolve the next runnable task, falling back to the main task. Stale ids
/// (fiber already reclaimed) are dropped and the search restarts, as are
/// queue entries damaged beyond resolution.
unsafe fn pick_next(g: &TaskGroup, steal: bool) -> &'static TaskMeta {
    loop {
        let tid = match g.rq.pop() {
            Some(tid) => Some(tid),
            None if steal => g.steal_one(),
            None => None,
        };
        let Some(tid) = tid else {
            return g.main_meta;
        };
        match address_meta(tid) {
            Some(meta) => return meta,
            None => {
                log::debug!("dropping stale tid {:?} from run queue", tid);
            }
        }
    }
}

/// Switch away from the current task to whatever is runnable next.
pub(crate) unsafe fn sched(pg: &mut *mut TaskGroup) {
    let g = unsafe { &**pg };
    let next = unsafe { pick_next(g, true) };
    unsafe { sched_to_meta(pg, next) }
}

/// Switch to a specific task.
pub(crate) unsafe fn sched_to(pg: &mut *mut TaskGroup, tid: FiberId) {
    match address_meta(tid) {
        Some(meta) => unsafe { sched_to_meta(pg, meta) },
        None => {
            // Version mismatch: the fiber died between enqueue and here.
            log::debug!("sched_to dropped stale tid {:?}", tid);
            let g = unsafe { &**pg };
            if !g.is_current_main_task() {
                unsafe { sched(pg) }
            }
        }
    }
}

pub(crate) unsafe fn sched_to_meta(pg: &mut *mut TaskGroup, next: &'static TaskMeta) {
    let g = unsafe { &**pg };
    let cur = g.cur_meta();

    if !ptr::eq(cur, next) {
        // First run of a fiber: give it a stack and format the entry frame.
        if next.stack().is_null() {
            match next.stack_type() {
                StackType::Pthread => next.set_stack(g.main_stack_ptr()),
                ty => match get_stack(ty) {
                    Ok(stack) => {
                        unsafe {
                            *(*stack).frame_ptr() = super::context::ContextFrame::for_fiber(
                                (*stack).top(),
                                task_runner_entry,
                                next as *const TaskMeta as usize,
                            );
                        }
                        next.set_stack(stack);
                    }
                    Err(err) => {
                        // Out of stack memory: degrade to running on the
                        // worker stack instead of failing the fiber.
                        log::warn!("stack allocation failed ({}), degrading to pthread mode", err);
                        next.set_stack_type(StackType::Pthread);
                        next.set_stack(g.main_stack_ptr());
                    }
                },
            }
        }
        next.set_state(FiberState::Running);
        g.set_cur_meta(next);

        let cur_stack = cur.stack();
        let next_stack = next.stack();
        if cur_stack != next_stack {
            // SAFETY: both frames live in stacks owned by this runtime; the
            // current one is ours, the next one is suspended.
            unsafe {
                switch_context((*cur_stack).frame_ptr(), (*next_stack).frame_ptr());
            }
            // Execution resumes here when this task is scheduled again,
            // possibly on a different worker.
        }
        // Same stack: a pthread-type task (worker stack) or a stack
        // transfer from a dying fiber; the caller falls through and runs it
        // without switching.
    }

    let g = tls_task_group();
    debug_assert!(!g.is_null());
    *pg = g;
    unsafe {
        (*g).run_remained();
    }
}

/// Entry point on a fresh fiber stack.
extern "C" fn task_runner_entry(meta: usize) -> ! {
    let _ = meta; // the current meta is re-read from the TaskGroup
    task_runner(false);
    unreachable!("fiber stack resumed after its final switch");
}

/// Run fibers until control belongs to the main task again. On a fiber
/// stack this loops only through stack transfers and never returns; on the
/// worker stack it runs pthread-type fibers in place and returns to the
/// main loop.
fn task_runner(skip_remained: bool) {
    let mut g = tls_task_group();
    if !skip_remained {
        unsafe {
            (*g).run_remained();
        }
    }
    loop {
        let meta = unsafe { (*g).cur_meta() };
        let tid = meta.tid();

        if let Some(entry) = meta.take_entry() {
            if meta.flags().contains(FiberFlags::LOG_START_AND_FINISH) {
                log::debug!("fiber {:?} started", tid);
            }
            match catch_unwind(AssertUnwindSafe(entry)) {
                Ok(()) => {}
                Err(payload) => {
                    if payload.downcast_ref::<FiberExitRequest>().is_none() {
                        log::error!("fiber {:?} panicked; treating as termination", tid);
                    }
                }
            }
            // The body may have migrated us to another worker.
            g = tls_task_group();
        }

        if meta.flags().contains(FiberFlags::LOG_START_AND_FINISH) {
            log::debug!("fiber {:?} finished", tid);
        }
        meta.set_local_storage(0);
        meta.set_state(FiberState::Finished);

        // Publish death and wake joiners: the version butex moves off the
        // id's version, so late joiners fail their compare and return.
        meta.version_butex()
            .value()
            .store(tid.version().wrapping_add(1) as i32, Ordering::Release);
        butex_wake_all(meta.version_butex(), true);

        // The next context reclaims our slot and (unless transferred) our
        // stack; we cannot free the ground we stand on.
        unsafe {
            (*g).set_remained(
                release_last_meta,
                meta as *const TaskMeta as *mut c_void,
            );
            let mut pg = g;
            ending_sched(&mut pg);
            g = pg;
        }

        if unsafe { (*g).is_current_main_task() } {
            return;
        }
    }
}

fn release_last_meta(arg: *mut c_void) {
    let meta = unsafe { &*(arg as *const TaskMeta) };
    let stack = meta.take_stack();
    if !stack.is_null() && unsafe { (*stack).kind() } != StackType::Main {
        return_stack(stack);
    }
    release_meta(meta.tid());
}

/// Schedule after the current fiber terminated. Tries to hand the dying
/// fiber's stack straight to a not-yet-started successor of the same class,
/// skipping a pool round trip.
unsafe fn ending_sched(pg: &mut *mut TaskGroup) {
    let g = unsafe { &**pg };
    let cur = g.cur_meta();
    let next = unsafe { pick_next(g, true) };

    if !ptr::eq(next, g.main_meta)
        && next.stack().is_null()
        && next.stack_type() == cur.stack_type()
        && cur.stack_type() != StackType::Pthread
    {
        let stack = cur.take_stack();
        if !stack.is_null() {
            next.set_stack(stack);
        }
    }
    unsafe { sched_to_meta(pg, next) }
}

// --- suspension entry points ---

/// Push the current fiber to the back of its run queue and run something
/// else. The push happens after the context save, via a remained callback.
pub(crate) unsafe fn yield_current(pg: &mut *mut TaskGroup) {
    let g = unsafe { &**pg };
    let cur = g.cur_meta();
    let mut args = ReadyToRunArgs {
        tid: cur.tid(),
        nosignal: false,
    };
    cur.set_state(FiberState::Ready);
    g.set_remained(ready_to_run_in_worker, &mut args as *mut ReadyToRunArgs as *mut c_void);
    unsafe { sched(pg) }
}

struct SleepArgs {
    meta: &'static TaskMeta,
    tid: FiberId,
    due: DueTime,
}

fn add_sleep_event(arg: *mut c_void) {
    let args = unsafe { &*(arg as *const SleepArgs) };
    let meta = args.meta;

    let wl = meta.waiter_lock().lock();
    if meta.pending_interrupt() {
        // Stopped/interrupted before we ever armed the timer; bounce the
        // fiber straight back so its sleep returns EINTR.
        drop(wl);
        schedule_ready(meta, args.tid, false);
        return;
    }
    let tid = args.tid;
    match global_timer_thread().schedule(args.due, Box::new(move || wakeup_sleeper(tid))) {
        Ok(token) => {
            meta.set_sleep_token(token);
            drop(wl);
        }
        Err(err) => {
            log::warn!("sleep without timer thread: {}", err);
            meta.mark_interrupted();
            drop(wl);
            schedule_ready(meta, args.tid, false);
        }
    }
}

fn wakeup_sleeper(tid: FiberId) {
    let Some(meta) = address_meta(tid) else {
        return;
    };
    {
        let _wl = meta.waiter_lock().lock();
        meta.take_sleep_token();
    }
    schedule_ready(meta, tid, false);
}

/// Suspend the current fiber until the timer fires or an interrupt arrives.
pub(crate) unsafe fn usleep_current(pg: &mut *mut TaskGroup, microseconds: u64) -> Result<(), Errno> {
    let g = unsafe { &**pg };
    let meta = g.cur_meta();
    if meta.is_stopped() {
        return Err(Errno::Interrupted);
    }
    if microseconds == 0 {
        unsafe { yield_current(pg) };
        return Ok(());
    }
    let args = SleepArgs {
        meta,
        tid: meta.tid(),
        due: DueTime::after(Duration::from_micros(microseconds)),
    };
    meta.set_state(FiberState::Suspended);
    g.set_remained(
        add_sleep_event,
        &args as *const SleepArgs as *mut c_void,
    );
    unsafe { sched(pg) };

    meta.take_sleep_token();
    if meta.take_interrupted() {
        Err(Errno::Interrupted)
    } else {
        Ok(())
    }
}

// --- stop / interrupt / join ---

/// Set the stop flag; cooperative checks and future waits observe it.
pub fn set_stopped(tid: FiberId) -> Result<(), Errno> {
    let meta = address_meta(tid).ok_or(Errno::InvalidArgument)?;
    meta.set_stopped();
    Ok(())
}

/// Interrupt whatever wait `tid` is in: detach it from a butex with EINTR,
/// or cancel its sleep timer. A fiber that is not waiting just has its
/// interrupt flag raised for the next suspension attempt.
pub fn interrupt(tid: FiberId) -> Result<(), Errno> {
    let meta = address_meta(tid).ok_or(Errno::InvalidArgument)?;
    meta.mark_interrupted();

    if butex::interrupt_wait(meta, tid, butex::WAIT_STATUS_INTERRUPTED) {
        // The wait result carries the interruption; the pending flag has
        // served its purpose.
        meta.take_interrupted();
        return Ok(());
    }

    let token = {
        let _wl = meta.waiter_lock().lock();
        meta.take_sleep_token()
    };
    if token != 0 {
        match global_timer_thread().unschedule(token) {
            super::timer::TimerStatus::Cancelled => {
                schedule_ready(meta, tid, false);
            }
            _ => {
                // The timer callback beat us to it and is waking the fiber;
                // the interrupt flag still makes the sleep return EINTR.
            }
        }
    }
    Ok(())
}

/// Block until `tid` terminates. Ids whose slot has been recycled are
/// treated as already finished.
pub fn join(tid: FiberId) -> Result<(), Errno> {
    if tid.is_invalid() {
        return Err(Errno::InvalidArgument);
    }
    let g = tls_task_group();
    if !g.is_null() && !unsafe { (*g).is_current_main_task() } {
        if unsafe { (*g).current_tid() } == tid {
            return Err(Errno::InvalidArgument);
        }
    }
    let expected = tid.version() as i32;
    loop {
        let Some(meta) = address_meta(tid) else {
            return Ok(());
        };
        let vb = meta.version_butex();
        if vb.value().load(Ordering::Acquire) != expected {
            return Ok(());
        }
        // Join is not a cancellation point: a stopped joiner still waits
        // (ignore_stop), and EINTR/EWOULDBLOCK just mean "look again".
        match butex::butex_wait_opts(vb, expected, None, true) {
            Ok(()) | Err(Errno::WouldBlock) | Err(Errno::Interrupted) => continue,
            Err(err) => return Err(err),
        }
    }
}

// --- starting fibers ---

fn new_fiber_meta(
    attr: &FiberAttr,
    tag: Tag,
    entry: FiberEntry,
) -> Result<(FiberId, &'static TaskMeta), Errno> {
    if TaskControl::global().is_stopped() {
        return Err(Errno::Stopped);
    }
    create_meta(attr, tag, entry)
}

/// Start a fiber and switch to it immediately; the caller goes to the back
/// of this worker's queue. Lowest latency start, worker callers only.
pub(crate) unsafe fn start_foreground(
    pg: &mut *mut TaskGroup,
    attr: &FiberAttr,
    entry: FiberEntry,
) -> Result<FiberId, Errno> {
    let g = unsafe { &**pg };
    let tag = attr.tag.unwrap_or_else(|| g.tag());
    let (tid, meta) = new_fiber_meta(attr, tag, entry)?;

    if g.is_current_pthread_task() {
        // Cannot abandon the worker stack; fall back to an ordinary enqueue.
        meta.set_state(FiberState::Ready);
        g.ready_to_run(tid, attr.flags.contains(FiberFlags::NOSIGNAL));
        return Ok(tid);
    }

    let cur = g.cur_meta();
    let mut args = ReadyToRunArgs {
        tid: cur.tid(),
        nosignal: attr.flags.contains(FiberFlags::NOSIGNAL) || cur.about_to_quit(),
    };
    cur.set_state(FiberState::Ready);
    g.set_remained(ready_to_run_in_worker, &mut args as *mut ReadyToRunArgs as *mut c_void);
    meta.set_state(FiberState::Ready);
    unsafe { sched_to_meta(pg, meta) };
    Ok(tid)
}

/// Start a fiber on this worker's queue. With `signal` a parked worker is
/// woken immediately; without it the task waits for the owner to reschedule
/// or for a later `fiber_flush`.
pub(crate) fn start_background(
    g: &TaskGroup,
    attr: &FiberAttr,
    entry: FiberEntry,
    signal: bool,
) -> Result<FiberId, Errno> {
    let tag = attr.tag.unwrap_or_else(|| g.tag());
    let (tid, meta) = new_fiber_meta(attr, tag, entry)?;
    let nosignal = !signal
        || attr.flags.contains(FiberFlags::NOSIGNAL)
        || g.cur_meta().about_to_quit();
    meta.set_state(FiberState::Ready);
    g.ready_to_run(tid, nosignal);
    Ok(tid)
}

/// Start a fiber from a thread that is not a worker: push to the chosen
/// group's remote queue and wake a parked worker.
pub(crate) fn start_from_non_worker(
    group: &'static TaskGroup,
    attr: &FiberAttr,
    tag: Tag,
    entry: FiberEntry,
) -> Result<FiberId, Errno> {
    let (tid, meta) = new_fiber_meta(attr, tag, entry)?;
    meta.set_state(FiberState::Ready);
    group.ready_to_run_remote(tid, attr.flags.contains(FiberFlags::NOSIGNAL));
    Ok(tid)
}
