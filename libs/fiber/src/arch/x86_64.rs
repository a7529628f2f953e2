// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::arch::global_asm;

// The saved frame layout, from the stored stack pointer upwards:
//
//   +0   r15
//   +8   r14
//   +16  r13
//   +24  r12    <- carries the fiber pointer into the trampoline
//   +32  rbx
//   +40  rbp
//   +48  return address
//
// The SysV xmm registers are caller-saved, so only the six integer
// callee-saved registers need to travel with the context.
global_asm! {
    ".balign 16",
    ".global vane_fiber_switch",
    "vane_fiber_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",

    ".balign 16",
    ".global vane_fiber_trampoline",
    "vane_fiber_trampoline:",
    // First entry into a fresh fiber. init_stack parked the fiber pointer
    // in the r12 slot; move it into the first argument register.
    "mov rdi, r12",
    // Terminate the frame pointer chain so unwinders stop here.
    "xor ebp, ebp",
    "call vane_fiber_entry",
    // vane_fiber_entry never returns.
    "ud2",
}

/// Seeds a fresh context frame at the top of `stack_top` so that the first
/// switch to the returned stack pointer lands in `vane_fiber_trampoline`
/// with `fiber` as its argument.
///
/// Returns the stack pointer to store as the fiber's saved context.
///
/// # Safety
///
/// `stack_top` must be the 16-byte aligned top of a writable region with at
/// least 56 bytes below it.
pub unsafe fn init_stack(stack_top: usize, fiber: *const ()) -> usize {
    debug_assert_eq!(stack_top % 16, 0);
    let sp = stack_top - 56;

    // Safety: the caller guarantees the frame below `stack_top` is writable.
    unsafe {
        let frame = sp as *mut usize;
        frame.add(0).write(0); // r15
        frame.add(1).write(0); // r14
        frame.add(2).write(0); // r13
        frame.add(3).write(fiber as usize); // r12
        frame.add(4).write(0); // rbx
        frame.add(5).write(0); // rbp
        frame.add(6).write(vane_fiber_trampoline_addr()); // return address
    }

    sp
}

fn vane_fiber_trampoline_addr() -> usize {
    unsafe extern "C" {
        fn vane_fiber_trampoline();
    }
    vane_fiber_trampoline as usize
}
