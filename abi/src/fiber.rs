//! Fiber identifiers, attributes and state machine.

use bitflags::bitflags;

// --- Pool configuration limits ---

/// Hard cap on live fibers; also the size of the id arena's pointer table.
pub const MAX_FIBERS: usize = 65536;
/// Smallest worker pool the runtime will run with.
pub const MIN_CONCURRENCY: usize = 3;
/// Largest worker pool `setconcurrency` accepts.
pub const MAX_CONCURRENCY: usize = 1024;
/// Upper bound on scheduling tags.
pub const MAX_TAGS: usize = 64;

/// Default partition for fibers started without an explicit tag.
pub const TAG_DEFAULT: Tag = 0;

/// Scheduling partition key. Workers and fibers carrying different tags
/// never share run queues.
pub type Tag = usize;

// --- FiberId ---

/// Identifier of a fiber.
///
/// Packs an arena slot index in the low 32 bits and a slot version in the
/// high 32 bits. The version advances every time a slot is recycled, so a
/// stale id can never alias a newer fiber occupying the same slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct FiberId(u64);

impl FiberId {
    /// The null id; never names a live fiber.
    pub const INVALID: FiberId = FiberId(0);

    #[inline]
    pub const fn from_parts(index: u32, version: u32) -> Self {
        Self(((version as u64) << 32) | index as u64)
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn as_bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn version(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

// --- FiberState ---

/// Type-safe fiber status with explicit state-machine semantics.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FiberState {
    /// Descriptor allocated but not yet enqueued anywhere.
    #[default]
    Created = 0,
    /// Waiting in a run queue (local, remote, or in transit to one).
    Ready = 1,
    /// Executing on a worker right now.
    Running = 2,
    /// Parked on a butex or timer; owned by a waiter list.
    Suspended = 3,
    /// Entry function returned; joiners woken; slot awaiting recycling.
    Finished = 4,
}

impl FiberState {
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Suspended,
            4 => Self::Finished,
            _ => Self::Created,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::Created => matches!(target, Self::Ready),
            Self::Ready => matches!(target, Self::Running),
            Self::Running => matches!(target, Self::Ready | Self::Suspended | Self::Finished),
            Self::Suspended => matches!(target, Self::Ready),
            Self::Finished => false,
        }
    }
}

// --- Stack classes ---

/// Which stack a fiber runs on.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StackType {
    /// No private stack: the body runs as a plain call on the worker's own
    /// stack and must never switch away from it.
    Pthread = 0,
    Small = 1,
    #[default]
    Normal = 2,
    Large = 3,
    /// Sentinel wrapping a worker thread's existing OS stack.
    Main = 4,
}

/// Default byte sizes of the pooled stack classes.
pub const STACK_SIZE_SMALL: usize = 32 * 1024;
pub const STACK_SIZE_NORMAL: usize = 1024 * 1024;
pub const STACK_SIZE_LARGE: usize = 8 * 1024 * 1024;
/// Default guard region below each pooled stack; 0 disables the guard page.
pub const GUARD_PAGE_SIZE: usize = 4096;

bitflags! {
    /// Fiber creation flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FiberFlags: u32 {
        /// Do not wake a parked worker on start; the producer batches
        /// wake-ups and makes them visible with `fiber_flush`.
        const NOSIGNAL = 0x01;
        /// `fiber_about_to_quit` is a no-op for this fiber.
        const NEVER_QUIT = 0x02;
        /// Log creation and termination of the fiber.
        const LOG_START_AND_FINISH = 0x04;
    }
}

// --- FiberAttr ---

/// Creation attributes for a fiber.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FiberAttr {
    pub stack_type: StackType,
    pub flags: FiberFlags,
    /// Scheduling partition. `None` inherits the creator's tag (or
    /// `TAG_DEFAULT` off-worker).
    pub tag: Option<Tag>,
}

impl FiberAttr {
    pub const NORMAL: FiberAttr = FiberAttr {
        stack_type: StackType::Normal,
        flags: FiberFlags::empty(),
        tag: None,
    };

    pub const SMALL: FiberAttr = FiberAttr {
        stack_type: StackType::Small,
        flags: FiberFlags::empty(),
        tag: None,
    };

    pub const LARGE: FiberAttr = FiberAttr {
        stack_type: StackType::Large,
        flags: FiberFlags::empty(),
        tag: None,
    };

    /// Run on the worker's own stack, without context switching.
    pub const PTHREAD: FiberAttr = FiberAttr {
        stack_type: StackType::Pthread,
        flags: FiberFlags::empty(),
        tag: None,
    };

    #[inline]
    pub const fn with_flags(mut self, flags: FiberFlags) -> Self {
        self.flags = flags;
        self
    }

    #[inline]
    pub const fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = Some(tag);
        self
    }
}

impl Default for FiberAttr {
    fn default() -> Self {
        Self::NORMAL
    }
}
