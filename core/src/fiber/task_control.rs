//! Process-wide owner of workers and TaskGroups.
//!
//! One `TaskControl` exists per process. It spawns workers, registers their
//! TaskGroups into per-tag arrays that stealers iterate without locks, and
//! fans wake-up signals out over the per-tag parking lots. The worker count
//! only ever grows; shrink requests are rejected.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use weft_abi::{Errno, FiberId, MAX_CONCURRENCY, Tag};
use weft_lib::WorkerRng;

use super::config::config;
use super::parking_lot::{PARKING_LOTS_PER_TAG, ParkingLot};
use super::task_group::{TaskGroup, set_tls_task_group};

/// Desired worker count recorded by `setconcurrency` calls that happen
/// before the pool starts. 0 means "use the config".
static DESIRED_CONCURRENCY: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn set_desired_concurrency(n: usize) {
    DESIRED_CONCURRENCY.store(n, Ordering::Release);
}

pub(crate) fn desired_concurrency() -> usize {
    let desired = DESIRED_CONCURRENCY.load(Ordering::Acquire);
    if desired > 0 { desired } else { config().concurrency }
}

/// User hooks executed on every new worker thread before it schedules.
static WORKER_START_FN: Mutex<Option<fn()>> = Mutex::new(None);
static TAGGED_WORKER_START_FN: Mutex<Option<fn(Tag)>> = Mutex::new(None);

pub fn set_worker_start_fn(hook: fn()) {
    *WORKER_START_FN.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
}

pub fn set_tagged_worker_start_fn(hook: fn(Tag)) {
    *TAGGED_WORKER_START_FN
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(hook);
}

struct TagSlot {
    groups: Box<[AtomicPtr<TaskGroup>]>,
    /// Registered groups; stealers read indices below this watermark.
    ngroup: AtomicUsize,
    /// Reservation counter for concurrent registrations.
    next_slot: AtomicUsize,
    lots: [ParkingLot; PARKING_LOTS_PER_TAG],
}

impl TagSlot {
    fn new() -> Self {
        let mut groups = Vec::with_capacity(MAX_CONCURRENCY);
        groups.resize_with(MAX_CONCURRENCY, || AtomicPtr::new(core::ptr::null_mut()));
        Self {
            groups: groups.into_boxed_slice(),
            ngroup: AtomicUsize::new(0),
            next_slot: AtomicUsize::new(0),
            lots: [
                ParkingLot::new(),
                ParkingLot::new(),
                ParkingLot::new(),
                ParkingLot::new(),
            ],
        }
    }
}

pub struct TaskControl {
    tags: Box<[TagSlot]>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    concurrency: AtomicUsize,
    next_worker_id: AtomicUsize,
    signal_seq: AtomicUsize,
    rr_seq: AtomicUsize,
    stopped: AtomicBool,
}

impl TaskControl {
    fn new() -> Self {
        let ntags = config().ntags;
        let mut tags = Vec::with_capacity(ntags);
        tags.resize_with(ntags, TagSlot::new);
        Self {
            tags: tags.into_boxed_slice(),
            workers: Mutex::new(Vec::new()),
            concurrency: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            signal_seq: AtomicUsize::new(0),
            rr_seq: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Spawn the initial workers, distributed round-robin over the tags,
    /// and wait until every tag has at least one registered group so that
    /// `choose_one_group` never comes up empty.
    fn start(&'static self) {
        let cfg = config();
        let initial = if cfg.min_concurrency > 0 {
            cfg.min_concurrency.max(self.tags.len())
        } else {
            desired_concurrency()
        };
        log::debug!(
            "starting fiber pool: {} workers over {} tag(s)",
            initial,
            self.tags.len()
        );
        for i in 0..initial {
            self.spawn_worker(i % self.tags.len());
        }
        for tag in 0..self.tags.len() {
            while self.tags[tag].ngroup.load(Ordering::Acquire) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn spawn_worker(&'static self, tag: Tag) -> bool {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::AcqRel);
        let spawned = std::thread::Builder::new()
            .name(format!("weft-worker-{}", worker_id))
            .spawn(move || worker_main(self, tag, worker_id));
        match spawned {
            Ok(handle) => {
                self.workers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(handle);
                true
            }
            Err(err) => {
                log::error!("failed to spawn worker thread: {}", err);
                false
            }
        }
    }

    pub(crate) fn register_group(&self, g: &'static TaskGroup, tag: Tag) {
        let slot = &self.tags[tag];
        let index = slot.next_slot.fetch_add(1, Ordering::AcqRel);
        if index >= slot.groups.len() {
            log::error!("tag {} worker table full; dropping worker registration", tag);
            return;
        }
        slot.groups[index].store(
            g as *const TaskGroup as *mut TaskGroup,
            Ordering::Release,
        );
        // Publish in order so the watermark never covers an empty cell.
        while slot
            .ngroup
            .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.concurrency.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Total live workers.
    pub fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Acquire)
    }

    /// Workers serving one tag.
    pub fn concurrency_by_tag(&self, tag: Tag) -> Result<usize, Errno> {
        if tag >= self.tags.len() {
            return Err(Errno::InvalidArgument);
        }
        Ok(self.tags[tag].ngroup.load(Ordering::Acquire))
    }

    pub fn ntags(&self) -> usize {
        self.tags.len()
    }

    pub(crate) fn parking_lot_for(&self, tag: Tag, worker_id: usize) -> &ParkingLot {
        &self.tags[tag].lots[worker_id % PARKING_LOTS_PER_TAG]
    }

    /// Pick a group of the tag for a remote push (round-robin).
    pub(crate) fn choose_one_group(&self, tag: Tag) -> &'static TaskGroup {
        let slot = &self.tags[tag];
        loop {
            let n = slot.ngroup.load(Ordering::Acquire);
            if n > 0 {
                let index = self.rr_seq.fetch_add(1, Ordering::AcqRel) % n;
                let g = slot.groups[index].load(Ordering::Acquire);
                if !g.is_null() {
                    // SAFETY: groups are leaked boxes, live forever.
                    return unsafe { &*g };
                }
            }
            // Workers for this tag are still booting.
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Steal one task from some group of the tag, visiting partners in a
    /// per-caller random order (random start, random odd stride).
    pub(crate) fn steal_task(&self, rng: &mut WorkerRng, tag: Tag) -> Option<FiberId> {
        let slot = &self.tags[tag];
        let n = slot.ngroup.load(Ordering::Acquire);
        if n == 0 {
            return None;
        }
        let start = rng.below(n as u64) as usize;
        let stride = rng.odd() as usize;
        let mut index = start;
        for _ in 0..n {
            let g = slot.groups[index % n].load(Ordering::Acquire);
            if !g.is_null() {
                let g = unsafe { &*g };
                if let Some(tid) = g.rq_steal() {
                    return Some(tid);
                }
                if let Some(tid) = g.remote_pop() {
                    return Some(tid);
                }
            }
            index = index.wrapping_add(stride);
        }
        None
    }

    /// Tell parked workers of the tag that `num` tasks were queued. Wakes
    /// at most two workers per call; stealing propagates the rest.
    pub(crate) fn signal_task(&'static self, num: usize, tag: Tag) {
        if num == 0 {
            return;
        }
        let mut remaining = num.min(2);
        let slot = &self.tags[tag];
        let start = self.signal_seq.fetch_add(1, Ordering::AcqRel);
        for i in 0..PARKING_LOTS_PER_TAG {
            if remaining == 0 {
                break;
            }
            let lot = &slot.lots[(start + i) % PARKING_LOTS_PER_TAG];
            remaining = remaining.saturating_sub(lot.signal(remaining));
        }
        // Lazy growth: if signals go unanswered and the pool is still below
        // its target, add a worker.
        if remaining > 0
            && config().min_concurrency > 0
            && self.concurrency() < desired_concurrency()
            && !self.is_stopped()
        {
            self.spawn_worker(tag);
        }
    }

    /// Snapshot of the local run-queue sizes of one tag's workers, for
    /// diagnostics. Sizes are racy by nature.
    pub fn runqueue_sizes(&self, tag: Tag) -> Vec<usize> {
        let Some(slot) = self.tags.get(tag) else {
            return Vec::new();
        };
        let n = slot.ngroup.load(Ordering::Acquire);
        let mut sizes = Vec::with_capacity(n);
        for entry in slot.groups.iter().take(n) {
            let g = entry.load(Ordering::Acquire);
            if !g.is_null() {
                sizes.push(unsafe { (*g).rq_size_hint() });
            }
        }
        sizes
    }

    /// Grow the pool. Returns how many workers were actually added.
    pub fn add_workers(&'static self, num: usize, tag: Tag) -> usize {
        if tag >= self.tags.len() || self.is_stopped() {
            return 0;
        }
        let mut added = 0;
        for _ in 0..num {
            if self.spawn_worker(tag) {
                added += 1;
            }
        }
        added
    }

    /// Stop every worker and wait for them to exit. Queued fibers are
    /// drained first; suspended fibers never resume.
    pub fn stop_and_join(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("stopping fiber pool");
        for slot in self.tags.iter() {
            for lot in slot.lots.iter() {
                lot.stop();
            }
        }
        let handles = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            core::mem::take(&mut *workers)
        };
        let me = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                log::error!("stop_and_join called from a worker; skipping self-join");
                continue;
            }
            let _ = handle.join();
        }
    }
}

fn worker_main(control: &'static TaskControl, tag: Tag, worker_id: usize) {
    let group = match TaskGroup::new(control, tag, worker_id) {
        Ok(group) => Box::leak(group),
        Err(err) => {
            log::error!("worker {} failed to build its TaskGroup: {}", worker_id, err);
            return;
        }
    };
    control.register_group(group, tag);
    set_tls_task_group(group as *const TaskGroup as *mut TaskGroup);

    let start_fn = *WORKER_START_FN.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(hook) = start_fn {
        hook();
    }
    let tagged_fn = *TAGGED_WORKER_START_FN
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if let Some(hook) = tagged_fn {
        hook(tag);
    }

    group.run_main_task();
    set_tls_task_group(core::ptr::null_mut());
}

static CONTROL: OnceLock<&'static TaskControl> = OnceLock::new();

impl TaskControl {
    /// The process-wide control, booting the pool on first use.
    pub fn global() -> &'static TaskControl {
        CONTROL.get_or_init(|| {
            let control: &'static TaskControl = Box::leak(Box::new(TaskControl::new()));
            control.start();
            control
        })
    }

    /// The control if the pool has ever started.
    pub fn try_global() -> Option<&'static TaskControl> {
        CONTROL.get().copied()
    }
}
