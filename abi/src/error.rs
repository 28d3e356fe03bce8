//! Error taxonomy of the fiber runtime.
//!
//! Fallible operations return `Result<_, Errno>`. The variants deliberately
//! mirror the classic POSIX codes the synchronization primitives are modeled
//! on, so callers familiar with futex-style APIs can map them one to one.

use core::fmt;

/// Errors surfaced by the public fiber operations.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Errno {
    /// Malformed argument: bad handle, unsupported configuration, self-join.
    InvalidArgument = 22,
    /// An absolute deadline expired before the awaited event happened.
    TimedOut = 110,
    /// The wait was interrupted by `fiber_stop`/`fiber_interrupt`.
    ///
    /// May also be surfaced spuriously; waiters must re-check their
    /// predicate in a loop.
    Interrupted = 4,
    /// The butex value did not match the expected value; the caller should
    /// reload and decide whether to sleep again.
    WouldBlock = 11,
    /// The requested change is not permitted (e.g. shrinking a live worker
    /// pool, reconfiguring after startup).
    PermissionDenied = 1,
    /// Allocation failure while setting up runtime structures.
    OutOfMemory = 12,
    /// The runtime has been stopped; no new work is accepted.
    Stopped = 114,
    /// A bounded queue or slot table is full.
    ResourceExhausted = 105,
}

impl Errno {
    /// Numeric code, for logs and for embedding in C-style status words.
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Reverse of `code`; `None` for codes outside the taxonomy.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            22 => Some(Self::InvalidArgument),
            110 => Some(Self::TimedOut),
            4 => Some(Self::Interrupted),
            11 => Some(Self::WouldBlock),
            1 => Some(Self::PermissionDenied),
            12 => Some(Self::OutOfMemory),
            114 => Some(Self::Stopped),
            105 => Some(Self::ResourceExhausted),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::TimedOut => "timed out",
            Self::Interrupted => "interrupted",
            Self::WouldBlock => "would block",
            Self::PermissionDenied => "permission denied",
            Self::OutOfMemory => "out of memory",
            Self::Stopped => "runtime stopped",
            Self::ResourceExhausted => "resource exhausted",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for Errno {}
