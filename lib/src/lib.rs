//! Support primitives for the weft runtime.
//!
//! Nothing in this crate knows about fibers or scheduling. It holds the
//! reusable pieces the core builds on: a versioned slot arena for ABA-safe
//! handles, wall/monotonic clock helpers, and a tiny PRNG used to spread
//! steal attempts across workers.

pub mod arena;
pub mod clock;
pub mod rand;

pub use arena::{Arena, ArenaSlot};
pub use clock::{DueTime, monotonic_ns, realtime_ns};
pub use rand::WorkerRng;
