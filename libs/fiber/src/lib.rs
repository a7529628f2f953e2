// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackful execution contexts for the vane tasklet runtime.
//!
//! A [`Fiber`] owns a guard-paged stack and a saved register context. The
//! scheduler switches a worker thread onto a fiber with [`Fiber::switch_in`]
//! and the code running on the fiber hands control back with
//! [`Fiber::switch_out`] (or directly to a sibling with [`Fiber::swap_to`]).
//! One fiber runs per thread at a time; the running fiber is tracked in a
//! thread local so that faults and suspension points can find it.

mod arch;
mod fault;
mod stack;

pub use fault::init_fault_handler;
pub use stack::{DEFAULT_STACK_SIZE, FiberStack, MIN_STACK_SIZE};

use core::cell::Cell;
use core::fmt;
use core::marker::PhantomPinned;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};
use std::io;

/// Lifecycle of a fiber.
///
/// The store that parks a fiber (`Yielding`/`Suspended`) is the publication
/// point of its saved context: a worker resuming the fiber on another
/// thread acquires the state before touching the saved stack pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Pooled and free to be bound to a tasklet.
    Runnable = 0,
    /// Currently executing on some worker thread.
    Running = 1,
    /// Cooperatively yielded; its tasklet is queued to run again.
    Yielding = 2,
    /// Parked on a wait list; will not run until explicitly rescheduled.
    Suspended = 3,
}

impl FiberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Runnable,
            1 => Self::Running,
            2 => Self::Yielding,
            3 => Self::Suspended,
            _ => unreachable!("invalid fiber state"),
        }
    }
}

std::thread_local! {
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
    static ROOT_CONTEXT: Cell<usize> = const { Cell::new(0) };
}

/// A stackful execution context.
///
/// Fibers are created through [`Fiber::new`], which boxes them so that the
/// context frame seeded onto the stack can refer back to the fiber by
/// address. A fiber must therefore never be moved out of its box.
pub struct Fiber {
    name: Box<str>,
    stack: FiberStack,
    /// Stack pointer of the saved context while the fiber is not running.
    saved_sp: Cell<usize>,
    state: AtomicU8,
    /// Opaque slot for the scheduler: the tasklet currently bound to this
    /// fiber. The fiber itself never dereferences it.
    tasklet: Cell<*mut ()>,
    entry: fn(),
    _pin: PhantomPinned,
}

// Safety: a fiber is only ever *run* by one thread at a time (enforced by
// the scheduler owning it), but it may be created on one thread and resumed
// on another after a steal.
unsafe impl Send for Fiber {}
// Safety: the interior Cells are only touched by the thread currently
// running or resuming the fiber; cross-thread handoff goes through the
// scheduler queues which order those accesses.
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber with the default stack size.
    ///
    /// # Errors
    ///
    /// Returns the OS error if stack allocation fails.
    pub fn new(name: impl Into<Box<str>>, entry: fn()) -> io::Result<Box<Self>> {
        Self::with_stack_size(name, DEFAULT_STACK_SIZE, entry)
    }

    /// Creates a fiber with at least `stack_size` bytes of usable stack.
    ///
    /// # Errors
    ///
    /// Returns the OS error if stack allocation fails.
    pub fn with_stack_size(
        name: impl Into<Box<str>>,
        stack_size: usize,
        entry: fn(),
    ) -> io::Result<Box<Self>> {
        let stack = FiberStack::new(stack_size)?;
        let fiber = Box::new(Self {
            name: name.into(),
            stack,
            saved_sp: Cell::new(0),
            state: AtomicU8::new(FiberState::Runnable as u8),
            tasklet: Cell::new(ptr::null_mut()),
            entry,
            _pin: PhantomPinned,
        });

        // Safety: the stack top is 16-byte aligned and writable, and the
        // fiber's address is stable from here on because it is boxed.
        let sp = unsafe { arch::init_stack(fiber.stack.top(), ptr::from_ref(&*fiber).cast()) };
        fiber.saved_sp.set(sp);

        tracing::trace!(name = %fiber.name, top = fiber.stack.top(), "created fiber");
        Ok(fiber)
    }

    /// The fiber currently running on this thread, if any.
    pub fn current() -> Option<NonNull<Fiber>> {
        NonNull::new(CURRENT_FIBER.with(Cell::get).cast_mut())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically swaps the state, returning the previous one.
    pub fn exchange_state(&self, state: FiberState) -> FiberState {
        FiberState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    pub fn is_running(&self) -> bool {
        self.state() == FiberState::Running
    }

    /// The tasklet bound to this fiber. Owned and interpreted entirely by
    /// the scheduler.
    pub fn bound_tasklet(&self) -> *mut () {
        self.tasklet.get()
    }

    pub fn bind_tasklet(&self, tasklet: *mut ()) {
        self.tasklet.set(tasklet);
    }

    /// Returns whether a faulting address belongs to this fiber's guard
    /// page. Used by the fault handler to diagnose stack overflows.
    pub fn is_guard_page(&self, addr: usize) -> bool {
        self.stack.contains_guard(addr)
    }

    /// Switches the calling thread onto this fiber, returning when the
    /// fiber next switches out.
    ///
    /// # Panics
    ///
    /// Panics if called while another fiber is already running on this
    /// thread; thread-to-fiber entry only happens from the scheduler loop.
    pub fn switch_in(&self) {
        assert!(
            Fiber::current().is_none(),
            "switch_in from within a fiber; use swap_to"
        );

        CURRENT_FIBER.with(|current| current.set(ptr::from_ref(self)));
        self.set_state(FiberState::Running);

        let root = ROOT_CONTEXT.with(Cell::as_ptr);
        // Safety: `root` stays valid for this thread, and `saved_sp` was
        // produced by init_stack or a previous switch out of this fiber.
        unsafe {
            arch::vane_fiber_switch(root, self.saved_sp.get());
        }

        CURRENT_FIBER.with(|current| current.set(ptr::null()));
    }

    /// Switches from this (currently running) fiber back to the thread's
    /// root context, i.e. the scheduler loop.
    ///
    /// The caller must have arranged for the fiber to be resumed again
    /// (re-enqueued, parked on a wait list) or recycled before calling this.
    pub fn switch_out(&self) {
        debug_assert_eq!(
            CURRENT_FIBER.with(Cell::get),
            ptr::from_ref(self),
            "switch_out from a fiber that is not running"
        );

        let root = ROOT_CONTEXT.with(Cell::get);
        // Safety: the root context was saved by the switch_in that entered
        // this fiber and has not been resumed since.
        unsafe {
            arch::vane_fiber_switch(self.saved_sp.as_ptr(), root);
        }
    }

    /// Switches from the currently running fiber directly to this one.
    ///
    /// With `exchange_current` the thread's current-fiber slot is updated to
    /// this fiber; without it the slot keeps naming the previous fiber so a
    /// suspended fiber can be reattached later.
    ///
    /// # Panics
    ///
    /// Panics if no fiber is running on this thread.
    pub fn swap_to(&self, exchange_current: bool) {
        let from = Fiber::current().expect("swap_to outside of a fiber");
        // Safety: the current fiber pointer is valid while it is running.
        let from = unsafe { from.as_ref() };

        self.set_state(FiberState::Running);
        if exchange_current {
            CURRENT_FIBER.with(|current| current.set(ptr::from_ref(self)));
        }

        // Safety: both stack pointers are live saved contexts.
        unsafe {
            arch::vane_fiber_switch(from.saved_sp.as_ptr(), self.saved_sp.get());
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// First Rust frame of every fiber; the architecture trampoline lands here.
#[unsafe(no_mangle)]
unsafe extern "C" fn vane_fiber_entry(fiber: *const Fiber) -> ! {
    // Safety: the trampoline passes the address seeded by init_stack, which
    // is the boxed fiber this stack belongs to.
    let fiber = unsafe { &*fiber };
    (fiber.entry)();
    // The entry function must switch away forever rather than return; there
    // is no context left to return into.
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static STEPS: AtomicUsize = AtomicUsize::new(0);

    fn bouncing_entry() {
        let fiber = Fiber::current().unwrap();
        // Safety: the fiber is alive for the duration of the test.
        let fiber = unsafe { fiber.as_ref() };
        for _ in 0..3 {
            STEPS.fetch_add(1, Ordering::Relaxed);
            fiber.set_state(FiberState::Yielding);
            fiber.switch_out();
        }
        // Park forever; the test drops the fiber while it is suspended.
        fiber.set_state(FiberState::Suspended);
        fiber.switch_out();
        unreachable!();
    }

    #[test]
    fn switch_in_and_out_round_trips() {
        STEPS.store(0, Ordering::Relaxed);
        let fiber = Fiber::new("test", bouncing_entry).unwrap();

        for expected in 1..=3 {
            fiber.switch_in();
            assert_eq!(STEPS.load(Ordering::Relaxed), expected);
            assert_eq!(fiber.state(), FiberState::Yielding);
            assert!(Fiber::current().is_none());
        }
    }

    #[test]
    fn current_is_set_while_running() {
        fn entry() {
            assert!(Fiber::current().is_some());
            let fiber = Fiber::current().unwrap();
            // Safety: alive for the duration of the test.
            let fiber = unsafe { fiber.as_ref() };
            assert_eq!(fiber.name(), "observer");
            assert!(fiber.is_running());
            fiber.set_state(FiberState::Suspended);
            fiber.switch_out();
            unreachable!();
        }

        assert!(Fiber::current().is_none());
        let fiber = Fiber::new("observer", entry).unwrap();
        fiber.switch_in();
        assert!(Fiber::current().is_none());
    }

    #[test]
    fn swap_to_hands_off_directly() {
        use std::ptr::null_mut;
        use std::sync::Mutex;
        use std::sync::atomic::AtomicPtr;

        static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
        static PARTNER: AtomicPtr<Fiber> = AtomicPtr::new(null_mut());

        fn first_entry() {
            LOG.lock().unwrap().push("first");
            let me = Fiber::current().unwrap();
            // Safety: alive for the duration of the test.
            let me = unsafe { me.as_ref() };
            me.set_state(FiberState::Suspended);

            // Hand off to the partner without bouncing through the thread
            // root.
            // Safety: the partner fiber outlives this switch.
            let partner = unsafe { &*PARTNER.load(Ordering::Acquire) };
            partner.swap_to(true);
            unreachable!("first fiber is never resumed");
        }

        fn second_entry() {
            LOG.lock().unwrap().push("second");
            let fiber = Fiber::current().unwrap();
            // Safety: alive for the duration of the test.
            let fiber = unsafe { fiber.as_ref() };
            assert_eq!(fiber.name(), "second");
            fiber.set_state(FiberState::Suspended);
            fiber.switch_out();
            unreachable!("second fiber is never resumed");
        }

        let first = Fiber::new("first", first_entry).unwrap();
        let second = Fiber::new("second", second_entry).unwrap();
        PARTNER.store(ptr::from_ref(&*second).cast_mut(), Ordering::Release);

        first.switch_in();

        assert_eq!(*LOG.lock().unwrap(), ["first", "second"]);
        assert!(Fiber::current().is_none());
        assert_eq!(first.state(), FiberState::Suspended);
        assert_eq!(second.state(), FiberState::Suspended);
    }

    #[test]
    fn bound_tasklet_slot_round_trips() {
        let fiber = Fiber::new("slot", bouncing_entry).unwrap();
        assert!(fiber.bound_tasklet().is_null());
        let marker = 0xf1b3_usize as *mut ();
        fiber.bind_tasklet(marker);
        assert_eq!(fiber.bound_tasklet(), marker);
    }
}
