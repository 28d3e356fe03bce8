//! Shared fixture for tests that exercise the process-wide pool.

use std::sync::Once;
use std::time::{Duration, Instant};

use super::config::{FiberConfig, configure};
use super::task_control::TaskControl;

/// Boot one small pool for the whole test binary. Tests share it, so none
/// of them may call `fiber_stop_world`.
pub fn boot_runtime() {
    static BOOT: Once = Once::new();
    BOOT.call_once(|| {
        let _ = configure(FiberConfig {
            concurrency: 4,
            ..FiberConfig::default()
        });
        TaskControl::global();
    });
}

/// Wall-clock milliseconds spent in `f`.
pub fn timed_ms(f: impl FnOnce()) -> u128 {
    let start = Instant::now();
    f();
    start.elapsed().as_millis()
}

/// Poll `cond` up to `limit`, sleeping briefly between probes.
pub fn wait_until(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
