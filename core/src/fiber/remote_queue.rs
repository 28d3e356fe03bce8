//! Bounded queue for fibers created by non-workers.
//!
//! Non-workers randomly choose a TaskGroup to push to, which already
//! spreads the contention, so a plain lock-protected ring is good enough
//! here. The nosignal counter rides under the same lock so that batched
//! remote starts and their flush cannot race apart.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex as SpinMutex;

use weft_abi::FiberId;

struct Ring {
    buf: Box<[FiberId]>,
    head: usize,
    len: usize,
    /// Remote tasks pushed with NOSIGNAL that have not been signaled yet.
    num_nosignal: usize,
}

pub struct RemoteTaskQueue {
    ring: SpinMutex<Ring>,
    /// Mirror of ring.len for the lock-free empty fast path.
    approx_len: AtomicUsize,
}

impl RemoteTaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: SpinMutex::new(Ring {
                buf: vec![FiberId::INVALID; capacity.max(1)].into_boxed_slice(),
                head: 0,
                len: 0,
                num_nosignal: 0,
            }),
            approx_len: AtomicUsize::new(0),
        }
    }

    pub fn pop(&self) -> Option<FiberId> {
        if self.approx_len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut ring = self.ring.lock();
        if ring.len == 0 {
            return None;
        }
        let tid = ring.buf[ring.head];
        ring.head = (ring.head + 1) % ring.buf.len();
        ring.len -= 1;
        self.approx_len.store(ring.len, Ordering::Release);
        Some(tid)
    }

    /// Push a task; with `nosignal` the wake-up is deferred until
    /// `take_nosignal` harvests the batch. Returns false when full.
    pub fn push(&self, tid: FiberId, nosignal: bool) -> bool {
        let mut ring = self.ring.lock();
        if ring.len == ring.buf.len() {
            return false;
        }
        let slot = (ring.head + ring.len) % ring.buf.len();
        ring.buf[slot] = tid;
        ring.len += 1;
        if nosignal {
            ring.num_nosignal += 1;
        }
        self.approx_len.store(ring.len, Ordering::Release);
        true
    }

    /// Harvest the pending nosignal count; the caller signals that many.
    pub fn take_nosignal(&self) -> usize {
        let mut ring = self.ring.lock();
        core::mem::take(&mut ring.num_nosignal)
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> FiberId {
        FiberId::from_parts(n, 1)
    }

    #[test]
    fn fifo_order() {
        let q = RemoteTaskQueue::new(4);
        assert!(q.push(id(1), false));
        assert!(q.push(id(2), false));
        assert_eq!(q.pop(), Some(id(1)));
        assert_eq!(q.pop(), Some(id(2)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn bounded() {
        let q = RemoteTaskQueue::new(2);
        assert!(q.push(id(1), false));
        assert!(q.push(id(2), false));
        assert!(!q.push(id(3), false));
        q.pop();
        assert!(q.push(id(3), false));
    }

    #[test]
    fn nosignal_batch_is_harvested_once() {
        let q = RemoteTaskQueue::new(8);
        q.push(id(1), true);
        q.push(id(2), true);
        q.push(id(3), false);
        assert_eq!(q.take_nosignal(), 2);
        assert_eq!(q.take_nosignal(), 0);
    }
}
