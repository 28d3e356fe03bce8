//! Raw context-switch tests: stack formatting, argument delivery, and
//! round-trip switching, without any scheduler involvement.

use core::sync::atomic::{AtomicUsize, Ordering};

use weft_abi::StackType;

use super::context::{ContextFrame, switch_context};
use super::stack::{get_stack, return_stack};

struct PingPong {
    main_frame: ContextFrame,
    fiber_frame: *mut ContextFrame,
    counter: AtomicUsize,
    seen_arg: AtomicUsize,
}

impl PingPong {
    fn new(fiber_frame: *mut ContextFrame) -> Box<Self> {
        Box::new(Self {
            main_frame: ContextFrame::zero(),
            fiber_frame,
            counter: AtomicUsize::new(0),
            seen_arg: AtomicUsize::new(0),
        })
    }

    fn main_frame_ptr(&self) -> *mut ContextFrame {
        &self.main_frame as *const ContextFrame as *mut ContextFrame
    }
}

extern "C" fn pingpong_runner(arg: usize) -> ! {
    let ctx = unsafe { &*(arg as *const PingPong) };
    ctx.seen_arg.store(arg, Ordering::SeqCst);
    ctx.counter.fetch_add(1, Ordering::SeqCst);
    unsafe {
        switch_context(ctx.fiber_frame, ctx.main_frame_ptr());
    }
    // Resumed by the second switch from the test body.
    ctx.counter.fetch_add(10, Ordering::SeqCst);
    unsafe {
        switch_context(ctx.fiber_frame, ctx.main_frame_ptr());
    }
    unreachable!("fiber context resumed after the test finished");
}

#[test]
fn switch_round_trip_preserves_control_flow() {
    let stack = get_stack(StackType::Small).unwrap();
    let ctx = PingPong::new(unsafe { (*stack).frame_ptr() });
    let arg = &*ctx as *const PingPong as usize;
    unsafe {
        *(*stack).frame_ptr() = ContextFrame::for_fiber((*stack).top(), pingpong_runner, arg);
        switch_context(ctx.main_frame_ptr(), (*stack).frame_ptr());
    }
    // First leg: the runner ran once and switched back.
    assert_eq!(ctx.counter.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.seen_arg.load(Ordering::SeqCst), arg);

    unsafe {
        switch_context(ctx.main_frame_ptr(), (*stack).frame_ptr());
    }
    // Second leg: the runner resumed exactly where it left off.
    assert_eq!(ctx.counter.load(Ordering::SeqCst), 11);

    return_stack(stack);
}

extern "C" fn deep_stack_runner(arg: usize) -> ! {
    let ctx = unsafe { &*(arg as *const PingPong) };
    // Burn some real stack to prove the fiber is not on the test stack.
    let mut buf = [0u8; 16 * 1024];
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = i as u8;
    }
    let sum: usize = buf.iter().map(|b| *b as usize).sum();
    ctx.counter.store(sum, Ordering::SeqCst);
    unsafe {
        switch_context(ctx.fiber_frame, ctx.main_frame_ptr());
    }
    unreachable!();
}

#[test]
fn fiber_runs_on_its_own_stack() {
    let stack = get_stack(StackType::Small).unwrap();
    let ctx = PingPong::new(unsafe { (*stack).frame_ptr() });
    let expected: usize = (0..16 * 1024usize).map(|i| (i as u8) as usize).sum();
    unsafe {
        *(*stack).frame_ptr() = ContextFrame::for_fiber(
            (*stack).top(),
            deep_stack_runner,
            &*ctx as *const PingPong as usize,
        );
        switch_context(ctx.main_frame_ptr(), (*stack).frame_ptr());
    }
    assert_eq!(ctx.counter.load(Ordering::SeqCst), expected);
    return_stack(stack);
}

#[test]
fn fresh_frames_are_stack_aligned() {
    let stack = get_stack(StackType::Small).unwrap();
    let frame = unsafe { ContextFrame::for_fiber((*stack).top(), pingpong_runner, 0) };
    #[cfg(target_arch = "x86_64")]
    {
        // rsp holds the trampoline return slot: top aligned to 16, minus 8.
        assert_eq!(frame.rsp % 16, 8);
    }
    #[cfg(target_arch = "aarch64")]
    {
        assert_eq!(frame.sp % 16, 0);
    }
    return_stack(stack);
}
