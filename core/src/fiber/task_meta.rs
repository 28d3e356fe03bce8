//! Per-fiber descriptors and the id arena.
//!
//! A `TaskMeta` is the control block of one fiber. Metas live in a
//! process-wide versioned arena: ids pack (slot index, slot version), slots
//! are never deallocated, and the version advances on every reuse, so a
//! stale `FiberId` resolves to nothing instead of to somebody else's fiber.
//!
//! The arena version is mirrored into each meta's `version_butex`: while the
//! fiber is alive the butex holds the id's version, and the terminating
//! fiber bumps it and wakes all joiners. That makes join a plain butex wait
//! and `fiber_exists` a single load.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicU32, AtomicU64,
                         AtomicUsize, Ordering};

use spin::Mutex as SpinMutex;
use std::sync::OnceLock;

use weft_abi::{Errno, FiberAttr, FiberFlags, FiberId, FiberState, MAX_FIBERS, StackType, Tag};
use weft_lib::Arena;

use super::butex::{Butex, ButexWaiter};
use super::stack::ContextualStack;

/// A fiber body. Boxed once at creation, consumed on first run.
pub type FiberEntry = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskMeta {
    tid: AtomicU64,
    state: AtomicU8,
    stop: AtomicBool,
    interrupted: AtomicBool,
    about_to_quit: AtomicBool,

    stack_type: AtomicU8,
    flags: AtomicU32,
    tag: AtomicUsize,

    entry: SpinMutex<Option<FiberEntry>>,
    stack: AtomicPtr<ContextualStack>,

    /// Guards the `current_waiter`/`current_sleep` handshakes between this
    /// fiber's suspension paths and interrupt/timeout paths that only hold
    /// the meta.
    waiter_lock: SpinMutex<()>,
    current_waiter: AtomicPtr<ButexWaiter>,
    current_sleep: AtomicU64,

    /// Value tracks the arena version: id's version while alive, bumped at
    /// termination. Joiners wait here.
    version_butex: Butex,

    local_storage: AtomicUsize,
    last_errno: AtomicI32,
}

impl Default for TaskMeta {
    fn default() -> Self {
        Self {
            tid: AtomicU64::new(0),
            state: AtomicU8::new(FiberState::Created.as_u8()),
            stop: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            about_to_quit: AtomicBool::new(false),
            stack_type: AtomicU8::new(StackType::Normal as u8),
            flags: AtomicU32::new(0),
            tag: AtomicUsize::new(weft_abi::TAG_DEFAULT),
            entry: SpinMutex::new(None),
            stack: AtomicPtr::new(core::ptr::null_mut()),
            waiter_lock: SpinMutex::new(()),
            current_waiter: AtomicPtr::new(core::ptr::null_mut()),
            current_sleep: AtomicU64::new(0),
            version_butex: Butex::new(0),
            local_storage: AtomicUsize::new(0),
            last_errno: AtomicI32::new(0),
        }
    }
}

impl TaskMeta {
    fn reset_for(&self, tid: FiberId, attr: &FiberAttr, tag: Tag, entry: FiberEntry) {
        debug_assert!(self.stack.load(Ordering::Acquire).is_null());
        self.tid.store(tid.as_bits(), Ordering::Release);
        self.state
            .store(FiberState::Created.as_u8(), Ordering::Release);
        self.stop.store(false, Ordering::Release);
        self.interrupted.store(false, Ordering::Release);
        self.about_to_quit.store(false, Ordering::Release);
        self.stack_type.store(attr.stack_type as u8, Ordering::Release);
        self.flags.store(attr.flags.bits(), Ordering::Release);
        self.tag.store(tag, Ordering::Release);
        *self.entry.lock() = Some(entry);
        self.current_waiter
            .store(core::ptr::null_mut(), Ordering::Release);
        self.current_sleep.store(0, Ordering::Release);
        self.local_storage.store(0, Ordering::Release);
        self.last_errno.store(0, Ordering::Release);
    }

    #[inline]
    pub fn tid(&self) -> FiberId {
        FiberId::from_bits(self.tid.load(Ordering::Acquire))
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: FiberState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag.load(Ordering::Acquire)
    }

    #[inline]
    pub fn stack_type(&self) -> StackType {
        match self.stack_type.load(Ordering::Acquire) {
            0 => StackType::Pthread,
            1 => StackType::Small,
            3 => StackType::Large,
            4 => StackType::Main,
            _ => StackType::Normal,
        }
    }

    #[inline]
    pub(crate) fn set_stack_type(&self, ty: StackType) {
        self.stack_type.store(ty as u8, Ordering::Release);
    }

    #[inline]
    pub fn flags(&self) -> FiberFlags {
        FiberFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn attr(&self) -> FiberAttr {
        FiberAttr {
            stack_type: self.stack_type(),
            flags: self.flags(),
            tag: Some(self.tag()),
        }
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_stopped(&self) {
        self.stop.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn mark_interrupted(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Consume a pending interrupt, if any.
    #[inline]
    pub(crate) fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Peek at the interrupt flag without consuming it.
    #[inline]
    pub(crate) fn pending_interrupt(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    #[inline]
    pub fn about_to_quit(&self) -> bool {
        self.about_to_quit.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_about_to_quit(&self) {
        self.about_to_quit.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn take_entry(&self) -> Option<FiberEntry> {
        self.entry.lock().take()
    }

    #[inline]
    pub(crate) fn stack(&self) -> *mut ContextualStack {
        self.stack.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_stack(&self, stack: *mut ContextualStack) {
        self.stack.store(stack, Ordering::Release);
    }

    #[inline]
    pub(crate) fn take_stack(&self) -> *mut ContextualStack {
        self.stack.swap(core::ptr::null_mut(), Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn waiter_lock(&self) -> &SpinMutex<()> {
        &self.waiter_lock
    }

    #[inline]
    pub(crate) fn current_waiter(&self) -> *mut ButexWaiter {
        self.current_waiter.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_current_waiter(&self, waiter: *mut ButexWaiter) {
        self.current_waiter.store(waiter, Ordering::Release);
    }

    #[inline]
    pub(crate) fn take_sleep_token(&self) -> u64 {
        self.current_sleep.swap(0, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn set_sleep_token(&self, token: u64) {
        self.current_sleep.store(token, Ordering::Release);
    }

    #[inline]
    pub(crate) fn version_butex(&self) -> &Butex {
        &self.version_butex
    }

    #[inline]
    pub fn local_storage(&self) -> usize {
        self.local_storage.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_local_storage(&self, value: usize) {
        self.local_storage.store(value, Ordering::Release);
    }

    #[inline]
    pub fn last_errno(&self) -> Option<Errno> {
        Errno::from_code(self.last_errno.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_last_errno(&self, err: Errno) {
        self.last_errno.store(err.code(), Ordering::Release);
    }
}

// --- Arena ---

static FIBER_ARENA: OnceLock<Arena<TaskMeta>> = OnceLock::new();

fn arena() -> &'static Arena<TaskMeta> {
    FIBER_ARENA.get_or_init(|| Arena::with_capacity(MAX_FIBERS))
}

/// Allocate and initialize a descriptor for a new fiber.
pub(crate) fn create_meta(
    attr: &FiberAttr,
    tag: Tag,
    entry: FiberEntry,
) -> Result<(FiberId, &'static TaskMeta), Errno> {
    let Some((index, version, slot)) = arena().acquire() else {
        log::error!("fiber arena exhausted ({} slots)", MAX_FIBERS);
        return Err(Errno::OutOfMemory);
    };
    let tid = FiberId::from_parts(index, version);
    let meta = slot.value();
    meta.reset_for(tid, attr, tag, entry);
    meta.version_butex
        .value()
        .store(version as i32, Ordering::Release);
    Ok((tid, meta))
}

/// Resolve an id to its live descriptor.
///
/// Liveness is decided by the version butex, not the raw arena version: a
/// terminating fiber publishes its death (bump + wake joiners) strictly
/// before the next execution context reclaims the slot, and in that window
/// the id must already resolve to nothing — otherwise a joiner that was
/// just released could still stop or inspect the corpse.
pub fn address_meta(tid: FiberId) -> Option<&'static TaskMeta> {
    if tid.is_invalid() {
        return None;
    }
    let slot = arena().resolve(tid.index(), tid.version())?;
    let meta = slot.value();
    if meta.version_butex.value().load(Ordering::Acquire) != tid.version() as i32 {
        return None;
    }
    Some(meta)
}

/// Retire a finished fiber's slot. The caller must already have published
/// the version bump through the meta's version butex.
pub(crate) fn release_meta(tid: FiberId) {
    arena().release(tid.index(), tid.version());
}

/// True until the fiber terminates (wakes its joiners), even if the id has
/// not been recycled yet.
pub fn fiber_exists(tid: FiberId) -> bool {
    address_meta(tid).is_some()
}
