//! Butex behavior under fiber waiters, thread waiters, timeouts and
//! interruption. Results are funneled out of fibers through atomics; a
//! panic inside a fiber terminates only that fiber.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use weft_abi::{Errno, FiberAttr, FiberFlags};
use weft_lib::{DueTime, realtime_ns};

use super::api::{
    fiber_exists, fiber_flush, fiber_join, fiber_start, fiber_start_lazy, fiber_stop,
    fiber_usleep,
};
use super::butex::{Butex, butex_wait, butex_wake, butex_wake_all};
use super::test_support::{boot_runtime, timed_ms, wait_until};

/// Encode a wait result for assertion outside the fiber.
fn code(result: Result<(), Errno>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

#[test]
fn wait_on_already_timedout_butex() {
    let butex = Butex::new(1);
    let due = DueTime::from_ns(realtime_ns());
    assert_eq!(butex_wait(&butex, 1, Some(due)), Err(Errno::TimedOut));
}

#[test]
fn mismatched_value_returns_would_block_before_deadline_checks() {
    // Value mismatch wins over an expired deadline.
    let butex = Butex::new(1);
    let due = DueTime::from_ns(0);
    assert_eq!(butex_wait(&butex, 2, Some(due)), Err(Errno::WouldBlock));
}

#[test]
fn would_block_on_fiber_path_too() {
    boot_runtime();
    let butex = Arc::new(Butex::new(1));
    let result = Arc::new(AtomicI32::new(-1));
    let (b, r) = (butex.clone(), result.clone());
    let tid = fiber_start(&FiberAttr::NORMAL, move || {
        r.store(code(butex_wait(&b, 2, None)), Ordering::SeqCst);
    })
    .unwrap();
    fiber_join(tid).unwrap();
    assert_eq!(result.load(Ordering::SeqCst), Errno::WouldBlock.code());
}

#[test]
fn wake_without_waiters_is_a_noop() {
    let butex = Butex::new(0);
    assert_eq!(butex_wake(&butex), 0);
    assert_eq!(butex_wake_all(&butex, true), 0);
}

#[test]
fn wake_releases_fiber_and_thread_waiters() {
    boot_runtime();
    let butex = Arc::new(Butex::new(7));
    let woken = Arc::new(AtomicUsize::new(0));

    let mut tids = Vec::new();
    for _ in 0..2 {
        let (b, w) = (butex.clone(), woken.clone());
        tids.push(
            fiber_start(&FiberAttr::NORMAL, move || {
                if butex_wait(&b, 7, None).is_ok() {
                    w.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap(),
        );
    }
    let thread = {
        let (b, w) = (butex.clone(), woken.clone());
        std::thread::spawn(move || {
            if butex_wait(&b, 7, None).is_ok() {
                w.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    assert!(wait_until(Duration::from_secs(5), || butex.waiter_count() == 3));
    butex.value().store(8, Ordering::Release);
    let mut n = 0;
    while n < 3 {
        n += butex_wake(&butex);
    }
    assert_eq!(butex_wake(&butex), 0);

    for tid in tids {
        fiber_join(tid).unwrap();
    }
    thread.join().unwrap();
    assert_eq!(woken.load(Ordering::SeqCst), 3);
}

#[test]
fn wake_all_drains_every_waiter() {
    boot_runtime();
    let butex = Arc::new(Butex::new(3));
    let woken = Arc::new(AtomicUsize::new(0));
    let mut tids = Vec::new();
    for _ in 0..5 {
        let (b, w) = (butex.clone(), woken.clone());
        tids.push(
            fiber_start(&FiberAttr::NORMAL, move || {
                if butex_wait(&b, 3, None).is_ok() {
                    w.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap(),
        );
    }
    assert!(wait_until(Duration::from_secs(5), || butex.waiter_count() == 5));
    butex.value().store(4, Ordering::Release);
    assert_eq!(butex_wake_all(&butex, true), 5);
    for tid in tids {
        fiber_join(tid).unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 5);
}

// Two fibers hand a token back and forth through two butexes. A WouldBlock
// result means the peer already published its store, which is just an early
// success.
#[test]
fn ping_pong_between_two_fibers() {
    boot_runtime();
    let b1 = Arc::new(Butex::new(0));
    let b2 = Arc::new(Butex::new(0));
    let ok_a = Arc::new(AtomicI32::new(-1));
    let ok_b = Arc::new(AtomicI32::new(-1));

    let fiber_a = {
        let (b1, b2, ok) = (b1.clone(), b2.clone(), ok_a.clone());
        fiber_start(&FiberAttr::NORMAL, move || {
            let r = butex_wait(&b1, 0, None);
            let good = matches!(r, Ok(()) | Err(Errno::WouldBlock));
            b2.value().store(1, Ordering::Release);
            butex_wake(&b2);
            ok.store(good as i32, Ordering::SeqCst);
        })
        .unwrap()
    };
    let fiber_b = {
        let (b1, b2, ok) = (b1.clone(), b2.clone(), ok_b.clone());
        fiber_start(&FiberAttr::NORMAL, move || {
            b1.value().store(1, Ordering::Release);
            butex_wake(&b1);
            let r = butex_wait(&b2, 0, None);
            ok.store(matches!(r, Ok(()) | Err(Errno::WouldBlock)) as i32, Ordering::SeqCst);
        })
        .unwrap()
    };

    fiber_join(fiber_a).unwrap();
    fiber_join(fiber_b).unwrap();
    assert_eq!(ok_a.load(Ordering::SeqCst), 1);
    assert_eq!(ok_b.load(Ordering::SeqCst), 1);
}

#[test]
fn timed_wait_expires_with_timedout() {
    boot_runtime();
    let butex = Arc::new(Butex::new(7));
    let result = Arc::new(AtomicI32::new(-1));
    let (b, r) = (butex.clone(), result.clone());
    let elapsed = timed_ms(|| {
        let tid = fiber_start(&FiberAttr::NORMAL, move || {
            let due = DueTime::after(Duration::from_millis(200));
            r.store(code(butex_wait(&b, 7, Some(due))), Ordering::SeqCst);
        })
        .unwrap();
        fiber_join(tid).unwrap();
    });
    assert_eq!(result.load(Ordering::SeqCst), Errno::TimedOut.code());
    assert!(elapsed >= 150, "timed wait returned after {}ms", elapsed);
    assert!(elapsed < 5_000, "timed wait took {}ms", elapsed);
}

#[test]
fn stop_interrupts_a_running_wait() {
    boot_runtime();
    let butex = Arc::new(Butex::new(7));
    let result = Arc::new(AtomicI32::new(-1));
    let (b, r) = (butex.clone(), result.clone());
    let tid = fiber_start(&FiberAttr::NORMAL, move || {
        let due = DueTime::after(Duration::from_secs(10));
        r.store(code(butex_wait(&b, 7, Some(due))), Ordering::SeqCst);
    })
    .unwrap();
    assert!(wait_until(Duration::from_secs(5), || butex.waiter_count() == 1));

    let elapsed = timed_ms(|| {
        fiber_stop(tid).unwrap();
        fiber_join(tid).unwrap();
    });
    assert_eq!(result.load(Ordering::SeqCst), Errno::Interrupted.code());
    assert!(elapsed < 2_000, "interrupt took {}ms", elapsed);
    // Stopping a dead fiber is a caller error.
    assert_eq!(fiber_stop(tid), Err(Errno::InvalidArgument));
}

// A NOSIGNAL fiber stopped before it ever runs: flush makes it runnable,
// its sleep returns EINTR at once, and the join is quick.
#[test]
fn stop_before_running_short_circuits_the_sleep() {
    boot_runtime();
    let result = Arc::new(AtomicI32::new(-1));
    let r = result.clone();
    let attr = FiberAttr::NORMAL.with_flags(FiberFlags::NOSIGNAL);
    let tid = fiber_start_lazy(&attr, move || {
        r.store(code(fiber_usleep(100_000)), Ordering::SeqCst);
    })
    .unwrap();
    fiber_stop(tid).unwrap();
    let elapsed = timed_ms(|| {
        fiber_flush();
        fiber_join(tid).unwrap();
    });
    assert_eq!(result.load(Ordering::SeqCst), Errno::Interrupted.code());
    assert!(elapsed < 2_000, "stopped fiber joined after {}ms", elapsed);
}

#[test]
fn stop_wakes_a_sleeping_fiber_early() {
    boot_runtime();
    let result = Arc::new(AtomicI32::new(-1));
    let started = Arc::new(AtomicUsize::new(0));
    let (r, s) = (result.clone(), started.clone());
    let tid = fiber_start(&FiberAttr::NORMAL, move || {
        s.store(1, Ordering::SeqCst);
        r.store(code(fiber_usleep(10_000_000)), Ordering::SeqCst);
    })
    .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        started.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(20));

    let elapsed = timed_ms(|| {
        fiber_stop(tid).unwrap();
        fiber_join(tid).unwrap();
    });
    assert_eq!(result.load(Ordering::SeqCst), Errno::Interrupted.code());
    assert!(elapsed < 3_000, "sleeping fiber stopped after {}ms", elapsed);
}

// Join is not a cancellation point: stopping the joiner does not abort its
// join; it completes when the target completes.
#[test]
fn join_survives_stop_of_the_joiner() {
    boot_runtime();
    let joined_after_ms = Arc::new(AtomicU64::new(0));

    let target = fiber_start(&FiberAttr::NORMAL, move || {
        let _ = fiber_usleep(300_000);
    })
    .unwrap();
    let joiner = {
        let joined_after_ms = joined_after_ms.clone();
        let start = std::time::Instant::now();
        fiber_start(&FiberAttr::NORMAL, move || {
            let _ = fiber_join(target);
            joined_after_ms.store(start.elapsed().as_millis() as u64, Ordering::SeqCst);
        })
        .unwrap()
    };

    std::thread::sleep(Duration::from_millis(50));
    let _ = fiber_stop(joiner);
    std::thread::sleep(Duration::from_millis(50));
    assert!(fiber_exists(target));
    assert!(fiber_exists(joiner));

    fiber_join(target).unwrap();
    fiber_join(joiner).unwrap();
    assert!(
        joined_after_ms.load(Ordering::SeqCst) >= 200,
        "joiner returned after {}ms, before its target finished",
        joined_after_ms.load(Ordering::SeqCst)
    );
}
