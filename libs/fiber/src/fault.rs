// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stack overflow diagnostics.
//!
//! A fault in a fiber's guard page means the fiber overflowed its stack.
//! The handler runs on a per-thread alternate stack (the faulting stack is
//! by definition unusable), checks the faulting address against the current
//! fiber's guard page and reports before aborting. Anything else is
//! re-raised with default disposition.

use crate::Fiber;
use core::cell::Cell;
use core::mem::MaybeUninit;
use core::ptr;
use std::io;

const ALT_STACK_SIZE: usize = 64 * 1024;

std::thread_local! {
    static ALT_STACK: Cell<*mut u8> = const { Cell::new(ptr::null_mut()) };
}

/// Installs the SIGSEGV handler and arms an alternate signal stack for the
/// calling thread.
///
/// Every scheduler worker calls this once at startup; calling it again on
/// the same thread is a no-op.
///
/// # Errors
///
/// Returns the OS error if the alternate stack or the handler cannot be
/// installed.
pub fn init_fault_handler() -> io::Result<()> {
    if !ALT_STACK.with(Cell::get).is_null() {
        return Ok(());
    }

    // The alternate stack lives for the rest of the thread; it is
    // deliberately leaked because signal handlers may outlive any scope
    // that could reclaim it.
    let alt = Box::into_raw(vec![0u8; ALT_STACK_SIZE].into_boxed_slice()).cast::<u8>();
    ALT_STACK.with(|cell| cell.set(alt));

    // Safety: `alt` is a valid allocation of ALT_STACK_SIZE bytes and the
    // sigaction arguments are well-formed.
    unsafe {
        let stack = libc::stack_t {
            ss_sp: alt.cast(),
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        if libc::sigaltstack(&stack, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut action: libc::sigaction = MaybeUninit::zeroed().assume_init();
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        action.sa_sigaction = handle_fault as usize;
        libc::sigemptyset(&raw mut action.sa_mask);
        if libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

extern "C" fn handle_fault(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    // Safety: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    let addr = unsafe { (*info).si_addr() } as usize;

    if let Some(fiber) = Fiber::current() {
        // Safety: the faulting thread was running this fiber.
        let fiber = unsafe { fiber.as_ref() };
        if fiber.is_guard_page(addr) {
            // Only async-signal-safe calls from here on.
            const MSG: &[u8] = b"fiber stack overflow (fault in guard page), aborting\n";
            // Safety: write(2) with a valid buffer is async-signal-safe.
            unsafe {
                libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
                libc::abort();
            }
        }
    }

    // Not ours: restore the default disposition and re-raise so the fault
    // is reported the usual way.
    // Safety: resetting to SIG_DFL and re-raising is async-signal-safe.
    unsafe {
        let mut action: libc::sigaction = MaybeUninit::zeroed().assume_init();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(signal, &action, ptr::null_mut());
        libc::raise(signal);
    }
}
