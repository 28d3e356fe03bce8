//! Process-wide runtime configuration.
//!
//! All knobs freeze at first use: the first call that needs the config (or
//! an explicit `configure`) pins it for the life of the process. The only
//! things that change later are the concurrency counters, and those only
//! grow (see `TaskControl`).

use std::sync::OnceLock;

use weft_abi::{
    Errno, GUARD_PAGE_SIZE, MAX_CONCURRENCY, MAX_TAGS, STACK_SIZE_LARGE, STACK_SIZE_NORMAL,
    STACK_SIZE_SMALL,
};

#[derive(Clone, Debug)]
pub struct FiberConfig {
    /// Worker threads to run (across all tags).
    pub concurrency: usize,
    /// When non-zero, start only this many workers and add the rest on
    /// demand as signals go unanswered.
    pub min_concurrency: usize,
    /// Number of scheduling partitions.
    pub ntags: usize,
    /// Per-worker run queue capacity; must be a power of two.
    pub runqueue_capacity: usize,
    /// Per-worker remote queue capacity.
    pub remote_queue_capacity: usize,
    pub stack_size_small: usize,
    pub stack_size_normal: usize,
    pub stack_size_large: usize,
    /// Guard region below each pooled stack; 0 disables it.
    pub guard_page_size: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            min_concurrency: 0,
            ntags: 1,
            runqueue_capacity: 4096,
            remote_queue_capacity: 2048,
            stack_size_small: STACK_SIZE_SMALL,
            stack_size_normal: STACK_SIZE_NORMAL,
            stack_size_large: STACK_SIZE_LARGE,
            guard_page_size: GUARD_PAGE_SIZE,
        }
    }
}

impl FiberConfig {
    fn validate(&self) -> Result<(), Errno> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(Errno::InvalidArgument);
        }
        if self.min_concurrency > self.concurrency {
            return Err(Errno::InvalidArgument);
        }
        if self.ntags == 0 || self.ntags > MAX_TAGS || self.ntags > self.concurrency {
            return Err(Errno::InvalidArgument);
        }
        if self.runqueue_capacity == 0
            || self.runqueue_capacity & (self.runqueue_capacity - 1) != 0
        {
            return Err(Errno::InvalidArgument);
        }
        if self.remote_queue_capacity == 0 {
            return Err(Errno::InvalidArgument);
        }
        if self.stack_size_small == 0
            || self.stack_size_small > self.stack_size_normal
            || self.stack_size_normal > self.stack_size_large
        {
            return Err(Errno::InvalidArgument);
        }
        Ok(())
    }
}

static CONFIG: OnceLock<FiberConfig> = OnceLock::new();

/// Install a configuration before the runtime starts. Fails with
/// `PermissionDenied` once the config has been frozen by any prior use.
pub fn configure(cfg: FiberConfig) -> Result<(), Errno> {
    cfg.validate()?;
    let mut installed = false;
    CONFIG.get_or_init(|| {
        installed = true;
        cfg.clone()
    });
    if installed {
        Ok(())
    } else {
        log::warn!("fiber runtime already configured; ignoring new configuration");
        Err(Errno::PermissionDenied)
    }
}

/// The frozen configuration, defaulting on first touch.
pub fn config() -> &'static FiberConfig {
    CONFIG.get_or_init(FiberConfig::default)
}
