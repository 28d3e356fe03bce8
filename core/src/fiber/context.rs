//! Register-level context switching.
//!
//! A `ContextFrame` holds the callee-saved register set of one suspended
//! execution, including the FPU control state, since fibers running user
//! code may change rounding modes. `switch_context` stores the live
//! registers into one frame and resurrects another; field offsets are wired
//! into the assembly with `offset_of!` so layout changes are caught at
//! compile time instead of corrupting stacks at run time.
//!
//! Fresh stacks are formatted so the first switch into them lands in a
//! trampoline that forwards a single pointer argument to the runner
//! function. The runner must never return; a fiber's last action is always a
//! jump away from its stack.

use core::mem::offset_of;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use x86_64::{ContextFrame, fiber_trampoline, switch_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub use aarch64::{ContextFrame, fiber_trampoline, switch_context};
    } else {
        compile_error!("no context-switch implementation for this architecture");
    }
}

/// Entry invoked on a fresh fiber stack. Receives the opaque argument that
/// was baked into the frame. Must never return.
pub type FiberRunner = extern "C" fn(usize) -> !;

#[cfg(target_arch = "x86_64")]
mod x86_64 {
    use super::*;
    use core::arch::naked_asm;

    /// Callee-saved state of the SysV x86_64 ABI plus FPU control words.
    #[repr(C)]
    #[derive(Clone, Copy, Debug)]
    pub struct ContextFrame {
        pub rbx: u64,
        pub r12: u64,
        pub r13: u64,
        pub r14: u64,
        pub r15: u64,
        pub rbp: u64,
        pub rsp: u64,
        pub rflags: u64,
        pub fcw: u16,
        _pad: u16,
        pub mxcsr: u32,
    }

    const OFF_RBX: usize = offset_of!(ContextFrame, rbx);
    const OFF_R12: usize = offset_of!(ContextFrame, r12);
    const OFF_R13: usize = offset_of!(ContextFrame, r13);
    const OFF_R14: usize = offset_of!(ContextFrame, r14);
    const OFF_R15: usize = offset_of!(ContextFrame, r15);
    const OFF_RBP: usize = offset_of!(ContextFrame, rbp);
    const OFF_RSP: usize = offset_of!(ContextFrame, rsp);
    const OFF_RFLAGS: usize = offset_of!(ContextFrame, rflags);
    const OFF_FCW: usize = offset_of!(ContextFrame, fcw);
    const OFF_MXCSR: usize = offset_of!(ContextFrame, mxcsr);

    const _: () = assert!(core::mem::size_of::<ContextFrame>() == 72);
    const _: () = assert!(OFF_MXCSR == OFF_FCW + 4);

    /// Default x87 control word: all exceptions masked, 64-bit precision.
    const FCW_DEFAULT: u16 = 0x037F;
    /// Default MXCSR: all SIMD exceptions masked.
    const MXCSR_DEFAULT: u32 = 0x1F80;

    impl ContextFrame {
        pub const fn zero() -> Self {
            Self {
                rbx: 0,
                r12: 0,
                r13: 0,
                r14: 0,
                r15: 0,
                rbp: 0,
                rsp: 0,
                rflags: 0x202,
                fcw: FCW_DEFAULT,
                _pad: 0,
                mxcsr: MXCSR_DEFAULT,
            }
        }

        /// Format `stack_top` so the first switch into this frame calls
        /// `runner(arg)` through the trampoline.
        ///
        /// # Safety
        /// `stack_top` must be the upper end of a writable stack with at
        /// least one page of headroom below it.
        pub unsafe fn for_fiber(stack_top: *mut u8, runner: FiberRunner, arg: usize) -> Self {
            // Keep the top 16-byte aligned; the trampoline's `call` then
            // produces the alignment the SysV ABI promises at fn entry.
            let top = (stack_top as usize) & !15usize;
            let slot = (top - 8) as *mut u64;
            // SAFETY: inside the caller-provided stack.
            unsafe {
                *slot = fiber_trampoline as usize as u64;
            }
            let mut frame = Self::zero();
            frame.rsp = slot as u64;
            frame.r12 = runner as usize as u64;
            frame.r13 = arg as u64;
            frame
        }
    }

    /// Save the current callee-saved registers into `prev` and resume the
    /// execution frozen in `next`.
    ///
    /// # Safety
    /// Both frames must be valid. `next` must describe either a formatted
    /// fresh stack or a context previously saved by this function whose
    /// stack is still intact. Must not be reentered for the same `prev`
    /// concurrently.
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_context(prev: *mut ContextFrame, next: *const ContextFrame) {
        naked_asm!(
            // rdi = prev, rsi = next
            "mov [rdi + {off_rbx}], rbx",
            "mov [rdi + {off_r12}], r12",
            "mov [rdi + {off_r13}], r13",
            "mov [rdi + {off_r14}], r14",
            "mov [rdi + {off_r15}], r15",
            "mov [rdi + {off_rbp}], rbp",
            "mov [rdi + {off_rsp}], rsp",
            "pushfq",
            "pop qword ptr [rdi + {off_rflags}]",
            "fnstcw word ptr [rdi + {off_fcw}]",
            "stmxcsr dword ptr [rdi + {off_mxcsr}]",
            "fldcw word ptr [rsi + {off_fcw}]",
            "ldmxcsr dword ptr [rsi + {off_mxcsr}]",
            "mov rbx, [rsi + {off_rbx}]",
            "mov r12, [rsi + {off_r12}]",
            "mov r13, [rsi + {off_r13}]",
            "mov r14, [rsi + {off_r14}]",
            "mov r15, [rsi + {off_r15}]",
            "mov rbp, [rsi + {off_rbp}]",
            "push qword ptr [rsi + {off_rflags}]",
            "popfq",
            // The switch point: from here on we run on the new stack. The
            // word at the new rsp is the resume address (the trampoline for
            // fresh stacks, a switch_context return site otherwise).
            "mov rsp, [rsi + {off_rsp}]",
            "ret",
            off_rbx = const OFF_RBX,
            off_r12 = const OFF_R12,
            off_r13 = const OFF_R13,
            off_r14 = const OFF_R14,
            off_r15 = const OFF_R15,
            off_rbp = const OFF_RBP,
            off_rsp = const OFF_RSP,
            off_rflags = const OFF_RFLAGS,
            off_fcw = const OFF_FCW,
            off_mxcsr = const OFF_MXCSR,
        );
    }

    /// First landing site on a fresh stack. The runner pointer and its
    /// argument ride in r12/r13, placed there by `ContextFrame::for_fiber`.
    #[unsafe(naked)]
    pub extern "C" fn fiber_trampoline() {
        naked_asm!(
            "mov rdi, r13",
            "call r12",
            // The runner never returns.
            "ud2",
        );
    }
}

#[cfg(target_arch = "aarch64")]
mod aarch64 {
    use super::*;
    use core::arch::naked_asm;

    /// Callee-saved state of the AAPCS64 ABI: x19-x28, fp, lr, sp, FPCR and
    /// the low halves of v8-v15.
    #[repr(C)]
    #[derive(Clone, Copy, Debug)]
    pub struct ContextFrame {
        pub x: [u64; 10], // x19..x28
        pub fp: u64,      // x29
        pub lr: u64,      // x30
        pub sp: u64,
        pub fpcr: u64,
        pub d: [u64; 8], // d8..d15
    }

    const _: () = assert!(offset_of!(ContextFrame, fp) == 80);
    const _: () = assert!(offset_of!(ContextFrame, lr) == 88);
    const _: () = assert!(offset_of!(ContextFrame, sp) == 96);
    const _: () = assert!(offset_of!(ContextFrame, fpcr) == 104);
    const _: () = assert!(offset_of!(ContextFrame, d) == 112);
    const _: () = assert!(core::mem::size_of::<ContextFrame>() == 176);

    impl ContextFrame {
        pub const fn zero() -> Self {
            Self {
                x: [0; 10],
                fp: 0,
                lr: 0,
                sp: 0,
                fpcr: 0,
                d: [0; 8],
            }
        }

        /// See the x86_64 counterpart. The runner pointer and argument ride
        /// in x19/x20.
        pub unsafe fn for_fiber(stack_top: *mut u8, runner: FiberRunner, arg: usize) -> Self {
            let top = (stack_top as usize) & !15usize;
            let mut frame = Self::zero();
            frame.sp = top as u64;
            frame.lr = fiber_trampoline as usize as u64;
            frame.x[0] = runner as usize as u64; // x19
            frame.x[1] = arg as u64; // x20
            frame
        }
    }

    /// # Safety
    /// Same contract as the x86_64 version.
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_context(prev: *mut ContextFrame, next: *const ContextFrame) {
        naked_asm!(
            // x0 = prev, x1 = next. Offsets pinned by the asserts above.
            "stp x19, x20, [x0, #0]",
            "stp x21, x22, [x0, #16]",
            "stp x23, x24, [x0, #32]",
            "stp x25, x26, [x0, #48]",
            "stp x27, x28, [x0, #64]",
            "stp x29, x30, [x0, #80]",
            "mov x9, sp",
            "str x9, [x0, #96]",
            "mrs x9, fpcr",
            "str x9, [x0, #104]",
            "stp d8, d9, [x0, #112]",
            "stp d10, d11, [x0, #128]",
            "stp d12, d13, [x0, #144]",
            "stp d14, d15, [x0, #160]",
            "ldp x19, x20, [x1, #0]",
            "ldp x21, x22, [x1, #16]",
            "ldp x23, x24, [x1, #32]",
            "ldp x25, x26, [x1, #48]",
            "ldp x27, x28, [x1, #64]",
            "ldr x9, [x1, #96]",
            "mov sp, x9",
            "ldr x9, [x1, #104]",
            "msr fpcr, x9",
            "ldp d8, d9, [x1, #112]",
            "ldp d10, d11, [x1, #128]",
            "ldp d12, d13, [x1, #144]",
            "ldp d14, d15, [x1, #160]",
            "ldp x29, x30, [x1, #80]",
            "ret",
        );
    }

    #[unsafe(naked)]
    pub extern "C" fn fiber_trampoline() {
        naked_asm!(
            "mov x0, x20",
            "blr x19",
            // The runner never returns.
            "brk #0",
        );
    }
}
