//! Chase-Lev work-stealing deque.
//!
//! The owning worker pushes and pops at the bottom (LIFO, cache-warm);
//! foreign workers steal from the top (FIFO). Seq-cst fences on the
//! bottom-decrement / top-CAS contention boundary are what make the classic
//! algorithm correct; everything else is acquire/release.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering, fence};

use weft_abi::Errno;

#[repr(align(64))]
struct CacheAligned<T>(T);

pub struct WorkStealingQueue<T> {
    bottom: AtomicUsize,
    capacity: usize,
    buffer: Box<[UnsafeCell<T>]>,
    top: CacheAligned<AtomicUsize>,
}

unsafe impl<T: Send> Send for WorkStealingQueue<T> {}
unsafe impl<T: Send> Sync for WorkStealingQueue<T> {}

impl<T: Copy + Default> WorkStealingQueue<T> {
    /// Capacity must be a non-zero power of two.
    pub fn new(capacity: usize) -> Result<Self, Errno> {
        if capacity == 0 || capacity & (capacity - 1) != 0 {
            log::error!("invalid run queue capacity={}, must be a power of 2", capacity);
            return Err(Errno::InvalidArgument);
        }
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, || UnsafeCell::new(T::default()));
        Ok(Self {
            bottom: AtomicUsize::new(1),
            capacity,
            buffer: buffer.into_boxed_slice(),
            top: CacheAligned(AtomicUsize::new(1)),
        })
    }

    #[inline]
    fn slot(&self, index: usize) -> *mut T {
        self.buffer[index & (self.capacity - 1)].get()
    }

    /// Push an item at the bottom. Returns false on a full queue.
    ///
    /// May run in parallel with `steal()`, never with another `push()` or
    /// `pop()` (owner-only).
    pub fn push(&self, value: T) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.0.load(Ordering::Acquire);
        if b >= t + self.capacity {
            return false;
        }
        // SAFETY: the slot at `b` is outside the readable window of any
        // concurrent steal until the bottom store below publishes it.
        unsafe {
            *self.slot(b) = value;
        }
        self.bottom.store(b + 1, Ordering::Release);
        true
    }

    /// Pop an item from the bottom. Owner-only, like `push`.
    pub fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed);
        let mut t = self.top.0.load(Ordering::Relaxed);
        if t >= b {
            // Fast check since pop() runs on every reschedule; a stale
            // smaller top never enters this branch.
            return None;
        }
        let newb = b - 1;
        self.bottom.store(newb, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        t = self.top.0.load(Ordering::Relaxed);
        if t > newb {
            self.bottom.store(b, Ordering::Relaxed);
            return None;
        }
        // SAFETY: the fence above ordered our bottom decrement before this
        // read; stealers past `newb` lost the race.
        let value = unsafe { *self.slot(newb) };
        if t != newb {
            return Some(value);
        }
        // Single remaining element: compete with stealers for it.
        let popped = self
            .top
            .0
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b, Ordering::Relaxed);
        if popped { Some(value) } else { None }
    }

    /// Steal one item from the top. Safe from any thread.
    pub fn steal(&self) -> Option<T> {
        let mut t = self.top.0.load(Ordering::Acquire);
        let mut b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            // Permit false negatives; callers iterate over victims anyway.
            return None;
        }
        loop {
            fence(Ordering::SeqCst);
            b = self.bottom.load(Ordering::Acquire);
            if t >= b {
                return None;
            }
            // SAFETY: value is re-validated by the CAS below; a torn read
            // cannot be observed because T is Copy and the slot is only
            // rewritten once top passes it.
            let value = unsafe { *self.slot(t) };
            match self
                .top
                .0
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return Some(value),
                Err(cur) => t = cur,
            }
        }
    }

    /// Racy size estimate, for logs and load balancing only.
    pub fn volatile_size(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.0.load(Ordering::Relaxed);
        b.saturating_sub(t)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
