//! Fiber stacks: guarded mmap storage plus per-class recycling pools.
//!
//! Three pooled size classes (small / normal / large) cover real fibers.
//! `Main` is a sentinel wrapping a worker thread's own OS stack; it carries
//! no storage, only the context frame the worker's scheduler loop is
//! suspended into. Pthread-type fibers borrow the worker's main stack and
//! therefore never allocate here at all.

use core::cell::UnsafeCell;
use core::ptr;

use spin::Mutex as SpinMutex;

use weft_abi::{Errno, StackType};

use super::config::config;
use super::context::ContextFrame;

/// One mmap'd stack with an optional PROT_NONE guard page at the low end.
pub struct StackStorage {
    base: *mut u8,
    mapped_len: usize,
    guard_size: usize,
}

unsafe impl Send for StackStorage {}

impl StackStorage {
    fn allocate(stack_size: usize, guard_size: usize) -> Result<Self, Errno> {
        let page = 4096usize;
        let guard = (guard_size + page - 1) & !(page - 1);
        let mapped_len = ((stack_size + page - 1) & !(page - 1)) + guard;
        // SAFETY: plain anonymous mapping; we own the region until munmap.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            log::error!("mmap of {} byte stack failed", mapped_len);
            return Err(Errno::OutOfMemory);
        }
        let base = base as *mut u8;
        if guard > 0 {
            // SAFETY: the guard range lies inside the fresh mapping.
            let rc = unsafe { libc::mprotect(base as *mut libc::c_void, guard, libc::PROT_NONE) };
            if rc != 0 {
                log::warn!("mprotect guard page failed; running without overflow guard");
            }
        }
        Ok(Self {
            base,
            mapped_len,
            guard_size: guard,
        })
    }

    /// Highest address; stacks grow down from here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // SAFETY: within the mapping bounds (one past the end is fine for
        // a stack top).
        unsafe { self.base.add(self.mapped_len) }
    }

    #[inline]
    pub fn usable_size(&self) -> usize {
        self.mapped_len - self.guard_size
    }
}

impl Drop for StackStorage {
    fn drop(&mut self) {
        // SAFETY: base/mapped_len came from mmap and are unmapped once.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mapped_len);
        }
    }
}

/// A stack together with the context frame of whatever execution is
/// currently suspended on it.
///
/// The frame lives with the stack, not with the fiber: a pthread-type fiber
/// shares the worker's main stack and with it the worker's frame, which is
/// exactly what makes "run on the worker stack without switching" fall out
/// of the pointer comparison in the scheduler.
pub struct ContextualStack {
    frame: UnsafeCell<ContextFrame>,
    storage: Option<StackStorage>,
    kind: StackType,
}

unsafe impl Send for ContextualStack {}
unsafe impl Sync for ContextualStack {}

impl ContextualStack {
    /// Sentinel for a worker's own OS stack.
    pub fn main_stack() -> Self {
        Self {
            frame: UnsafeCell::new(ContextFrame::zero()),
            storage: None,
            kind: StackType::Main,
        }
    }

    #[inline]
    pub fn kind(&self) -> StackType {
        self.kind
    }

    #[inline]
    pub fn frame_ptr(&self) -> *mut ContextFrame {
        self.frame.get()
    }

    #[inline]
    pub fn top(&self) -> *mut u8 {
        match &self.storage {
            Some(storage) => storage.top(),
            None => ptr::null_mut(),
        }
    }
}

// --- Pools ---

struct StackPool {
    class: StackType,
    free: SpinMutex<Vec<*mut ContextualStack>>,
    max_free: usize,
}

unsafe impl Send for StackPool {}
unsafe impl Sync for StackPool {}

impl StackPool {
    const fn new(class: StackType, max_free: usize) -> Self {
        Self {
            class,
            free: SpinMutex::new(Vec::new()),
            max_free,
        }
    }

    fn class_size(&self) -> usize {
        let cfg = config();
        match self.class {
            StackType::Small => cfg.stack_size_small,
            StackType::Large => cfg.stack_size_large,
            _ => cfg.stack_size_normal,
        }
    }

    fn get(&self) -> Result<*mut ContextualStack, Errno> {
        if let Some(stack) = self.free.lock().pop() {
            return Ok(stack);
        }
        let storage = StackStorage::allocate(self.class_size(), config().guard_page_size)?;
        let stack = Box::new(ContextualStack {
            frame: UnsafeCell::new(ContextFrame::zero()),
            storage: Some(storage),
            kind: self.class,
        });
        Ok(Box::into_raw(stack))
    }

    fn put(&self, stack: *mut ContextualStack) {
        // Drop the saved context so a recycled stack can never be resumed
        // through a stale frame.
        unsafe {
            *(*stack).frame.get() = ContextFrame::zero();
        }
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(stack);
        } else {
            drop(free);
            // SAFETY: pointer came from Box::into_raw in get().
            drop(unsafe { Box::from_raw(stack) });
        }
    }
}

static SMALL_POOL: StackPool = StackPool::new(StackType::Small, 64);
static NORMAL_POOL: StackPool = StackPool::new(StackType::Normal, 64);
static LARGE_POOL: StackPool = StackPool::new(StackType::Large, 2);

fn pool_for(class: StackType) -> Option<&'static StackPool> {
    match class {
        StackType::Small => Some(&SMALL_POOL),
        StackType::Normal => Some(&NORMAL_POOL),
        StackType::Large => Some(&LARGE_POOL),
        StackType::Pthread | StackType::Main => None,
    }
}

/// Take a pooled stack of the given class. `Pthread`/`Main` have no pooled
/// representation and yield an error; callers handle those kinds before
/// coming here.
pub fn get_stack(class: StackType) -> Result<*mut ContextualStack, Errno> {
    match pool_for(class) {
        Some(pool) => pool.get(),
        None => Err(Errno::InvalidArgument),
    }
}

/// Return a stack obtained from `get_stack`. Never called for main-stack
/// sentinels (the scheduler filters them out).
pub fn return_stack(stack: *mut ContextualStack) {
    if stack.is_null() {
        return;
    }
    let kind = unsafe { (*stack).kind };
    match pool_for(kind) {
        Some(pool) => pool.put(stack),
        None => {
            log::error!("attempt to return a {:?} stack to the pools", kind);
            debug_assert!(false, "returned a non-pooled stack");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_storage_has_usable_size() {
        let storage = StackStorage::allocate(64 * 1024, 4096).unwrap();
        assert!(storage.usable_size() >= 64 * 1024);
        assert!(!storage.top().is_null());
    }

    #[test]
    fn pool_recycles_stacks() {
        let a = get_stack(StackType::Small).unwrap();
        let top_a = unsafe { (*a).top() };
        return_stack(a);
        let b = get_stack(StackType::Small).unwrap();
        // LIFO pool hands the same storage back.
        assert_eq!(top_a, unsafe { (*b).top() });
        return_stack(b);
    }

    #[test]
    fn main_stack_is_storage_free() {
        let main = ContextualStack::main_stack();
        assert_eq!(main.kind(), StackType::Main);
        assert!(main.top().is_null());
    }
}
