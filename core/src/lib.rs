//! weft-core: the M:N fiber runtime.
//!
//! Fibers are cooperatively scheduled user-space tasks multiplexed onto a
//! fixed pool of worker threads; blocking primitives park fibers instead of
//! kernel threads. Fibers suspend only at documented points (butex waits,
//! sleeps, joins, yields, contended locks); everything else runs to
//! completion without preemption.

pub mod fiber;

pub use fiber::api::{
    FiberList, fiber_about_to_quit, fiber_errno, fiber_exists, fiber_exit, fiber_flush,
    fiber_get_local, fiber_getattr, fiber_getconcurrency, fiber_getconcurrency_by_tag,
    fiber_interrupt, fiber_join, fiber_self, fiber_self_tag, fiber_set_local,
    fiber_setconcurrency, fiber_setconcurrency_by_tag, fiber_start, fiber_start_lazy,
    fiber_stop, fiber_stop_world, fiber_stopped, fiber_timer_add, fiber_timer_del,
    fiber_usleep, fiber_yield, is_running_on_fiber, is_running_on_pthread,
    set_tagged_worker_start_fn, set_worker_start_fn,
};
pub use fiber::butex::{Butex, butex_requeue, butex_wait, butex_wake, butex_wake_all};
pub use fiber::cond::FiberCond;
pub use fiber::config::{FiberConfig, configure};
pub use fiber::countdown::CountdownEvent;
pub use fiber::mutex::{FiberMutex, FiberMutexGuard};
pub use fiber::timer::{TimerStatus, TimerToken};

pub use weft_abi::{Errno, FiberAttr, FiberFlags, FiberId, FiberState, StackType, Tag};
pub use weft_lib::DueTime;
