//! Versioned slot arena.
//!
//! Hands out `(index, version)` pairs that remain detectable forever: a
//! slot's version is bumped both when the slot is acquired and when it is
//! released, so any id captured before a release can never be confused with
//! the slot's next occupant. Live slots carry an odd version, free slots an
//! even one.
//!
//! Slot payloads are boxed once and never deallocated, which gives every
//! occupant a stable address for the lifetime of the process. Reusing a slot
//! reuses the payload in place; the caller is responsible for resetting
//! whatever interior state needs resetting.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use spin::Mutex;

/// One payload plus its recycling counter.
pub struct ArenaSlot<T> {
    version: AtomicU32,
    value: T,
}

impl<T> ArenaSlot<T> {
    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Current version counter. Odd means the slot is live.
    #[inline]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }
}

/// Fixed-capacity arena of versioned slots.
pub struct Arena<T> {
    table: Box<[AtomicPtr<ArenaSlot<T>>]>,
    free: Mutex<Vec<u32>>,
    next_index: AtomicU32,
    capacity: u32,
}

unsafe impl<T: Send + Sync> Send for Arena<T> {}
unsafe impl<T: Send + Sync> Sync for Arena<T> {}

impl<T: Default> Arena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut table = Vec::with_capacity(capacity);
        table.resize_with(capacity, || AtomicPtr::new(core::ptr::null_mut()));
        Self {
            table: table.into_boxed_slice(),
            free: Mutex::new(Vec::new()),
            next_index: AtomicU32::new(0),
            capacity: capacity as u32,
        }
    }

    /// Take a slot, either recycled or freshly allocated.
    ///
    /// Returns the slot's index, its new (odd) version, and the payload.
    /// `None` when the arena is exhausted.
    pub fn acquire(&self) -> Option<(u32, u32, &ArenaSlot<T>)> {
        if let Some(index) = self.free.lock().pop() {
            let slot = self.slot(index)?;
            // Free slots hold an even version; bumping makes them live.
            let version = slot.version.fetch_add(1, Ordering::AcqRel) + 1;
            debug_assert!(version % 2 == 1);
            return Some((index, version, slot));
        }

        let index = self.next_index.fetch_add(1, Ordering::AcqRel);
        if index >= self.capacity {
            // Undo so repeated failures cannot wrap the counter.
            self.next_index.store(self.capacity, Ordering::Release);
            log::warn!("arena exhausted at {} slots", self.capacity);
            return None;
        }
        let slot = Box::new(ArenaSlot {
            version: AtomicU32::new(1),
            value: T::default(),
        });
        let ptr = Box::into_raw(slot);
        self.table[index as usize].store(ptr, Ordering::Release);
        // SAFETY: freshly leaked box; the table keeps it alive forever.
        Some((index, 1, unsafe { &*ptr }))
    }

    /// Resolve an id to its payload if the slot still holds that occupant.
    pub fn resolve(&self, index: u32, version: u32) -> Option<&ArenaSlot<T>> {
        let slot = self.slot(index)?;
        if slot.version.load(Ordering::Acquire) == version && version % 2 == 1 {
            Some(slot)
        } else {
            None
        }
    }

    /// Access a slot regardless of occupancy. Useful when the caller
    /// performs its own version handshake on the payload.
    #[inline]
    pub fn slot(&self, index: u32) -> Option<&ArenaSlot<T>> {
        let ptr = self.table.get(index as usize)?.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: non-null entries point at leaked boxes that are never
            // deallocated.
            Some(unsafe { &*ptr })
        }
    }

    /// Retire a live slot. Returns false if `version` no longer matches
    /// (already released, or recycled by someone else).
    pub fn release(&self, index: u32, version: u32) -> bool {
        let Some(slot) = self.slot(index) else {
            return false;
        };
        if slot
            .version
            .compare_exchange(version, version + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.free.lock().push(index);
        true
    }

    /// Number of slots ever allocated (live + free).
    #[inline]
    pub fn allocated(&self) -> usize {
        (self.next_index.load(Ordering::Acquire).min(self.capacity)) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_resolve_release() {
        let arena: Arena<u64> = Arena::with_capacity(4);
        let (index, version, _slot) = arena.acquire().unwrap();
        assert_eq!(version % 2, 1);
        assert!(arena.resolve(index, version).is_some());
        assert!(arena.release(index, version));
        assert!(arena.resolve(index, version).is_none());
        // Double release must fail.
        assert!(!arena.release(index, version));
    }

    #[test]
    fn recycled_slot_gets_new_version() {
        let arena: Arena<u64> = Arena::with_capacity(2);
        let (i1, v1, _) = arena.acquire().unwrap();
        arena.release(i1, v1);
        let (i2, v2, _) = arena.acquire().unwrap();
        assert_eq!(i1, i2);
        assert!(v2 > v1);
        assert!(arena.resolve(i1, v1).is_none());
        assert!(arena.resolve(i2, v2).is_some());
    }

    #[test]
    fn exhaustion_returns_none() {
        let arena: Arena<u64> = Arena::with_capacity(1);
        let (index, version, _) = arena.acquire().unwrap();
        assert!(arena.acquire().is_none());
        arena.release(index, version);
        assert!(arena.acquire().is_some());
    }
}
