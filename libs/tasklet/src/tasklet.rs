// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The tasklet allocation.
//!
//! Every scheduled unit of work is a `PromisedTasklet<F, R>`: a single heap
//! allocation laid out as
//!
//! ```text
//! +----------------------+
//! | RawTasklet           |  <- queues and wait lists hold this address
//! | refs / destroy       |
//! | Promise<R>           |  <- futures read the result through here
//! +----------------------+
//! | callable (Option<F>) |
//! +----------------------+
//! ```
//!
//! The scheduler only ever sees `*mut RawTasklet`; the invoker function
//! pointer recovers the concrete type. The allocation is intrusively
//! refcounted: the run itself holds one reference (released after the
//! callable finishes and the promise is fulfilled) and every live
//! [`Future`](crate::Future) holds another.

use crate::promise::Promise;
use crate::scheduler::Shared;
use core::cell::{Cell, UnsafeCell};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use vane_fiber::Fiber;

/// Type-erased tasklet header. Always the first field of a
/// [`PromiseHeader`], which is always the first field of the concrete
/// tasklet allocation.
#[repr(C)]
pub(crate) struct RawTasklet {
    /// Runs the tasklet's callable and fulfills its promise. Must be called
    /// at most once.
    pub(crate) invoke: unsafe fn(NonNull<RawTasklet>),
    /// Intrusive link into at most one wait list (or run queue chain) at a
    /// time.
    pub(crate) next: AtomicPtr<RawTasklet>,
    /// The fiber this tasklet is bound to, once it has started executing.
    /// Null while the tasklet has never run. Only the scheduler touches
    /// this; cross-thread handoff is ordered by the run queues.
    pub(crate) owner: Cell<*const Fiber>,
    /// The scheduler this tasklet belongs to, so wakeups from arbitrary
    /// threads know where to enqueue.
    pub(crate) scheduler: Cell<*const Shared>,
}

/// The refcounted, promise-carrying prefix shared by every tasklet
/// allocation, independent of the callable type.
#[repr(C)]
pub(crate) struct PromiseHeader<R> {
    pub(crate) raw: RawTasklet,
    refs: AtomicU32,
    /// Frees the whole concrete allocation. Erased so that reference
    /// counting does not need to know the callable type.
    destroy: unsafe fn(NonNull<RawTasklet>),
    pub(crate) promise: Promise<R>,
}

#[repr(C)]
struct PromisedTasklet<F, R> {
    header: PromiseHeader<R>,
    callable: UnsafeCell<Option<F>>,
}

// The refcount and destroy fn sit in front of the generic promise payload,
// so their offsets are the same for every `R`.
static_assertions::assert_eq_size!(usize, unsafe fn(NonNull<RawTasklet>));

/// Allocates a tasklet for `callable`, returning the erased tasklet pointer
/// (refcount 2: one for the run, one for the caller's future handle).
pub(crate) fn new_promised<F, R>(
    callable: F,
    scheduler: *const Shared,
) -> NonNull<PromiseHeader<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let tasklet = Box::new(PromisedTasklet {
        header: PromiseHeader {
            raw: RawTasklet {
                invoke: invoke_promised::<F, R>,
                next: AtomicPtr::new(ptr::null_mut()),
                owner: Cell::new(ptr::null()),
                scheduler: Cell::new(scheduler),
            },
            refs: AtomicU32::new(2),
            destroy: destroy_promised::<F, R>,
            promise: Promise::<R>::new(),
        },
        callable: UnsafeCell::new(Some(callable)),
    });

    // Safety: Box::into_raw never returns null.
    unsafe { NonNull::new_unchecked(Box::into_raw(tasklet)).cast() }
}

unsafe fn invoke_promised<F, R>(raw: NonNull<RawTasklet>)
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let this = raw.cast::<PromisedTasklet<F, R>>();

    // Safety: `invoke` is called exactly once, by the fiber the scheduler
    // bound this tasklet to; nothing else touches the callable slot.
    let callable = unsafe {
        (*this.as_ref().callable.get())
            .take()
            .expect("tasklet invoked twice")
    };

    let result = callable();

    // Safety: `this` stays alive until the run reference is released below.
    unsafe {
        this.as_ref().header.promise.fulfill(result);
        // Release the run's reference; any outstanding futures keep the
        // allocation (and the fulfilled value) alive.
        drop_ref(raw);
    }
}

unsafe fn destroy_promised<F, R>(raw: NonNull<RawTasklet>) {
    // Safety: the refcount reached zero, so this is the last pointer to the
    // allocation, which was created by Box::new in new_promised.
    unsafe {
        drop(Box::from_raw(raw.cast::<PromisedTasklet<F, R>>().as_ptr()));
    }
}

/// Views the type-independent header prefix of a tasklet allocation.
///
/// # Safety
///
/// `raw` must point at the `RawTasklet` inside a live tasklet allocation.
unsafe fn header_prefix<'a>(raw: NonNull<RawTasklet>) -> &'a PromiseHeader<()> {
    // The refs and destroy fields live in front of the generic payload, so
    // the `()` instantiation reads them at the correct offsets for any `R`.
    // Safety: see above.
    unsafe { raw.cast::<PromiseHeader<()>>().as_ref() }
}

/// Bumps the tasklet's reference count.
///
/// # Safety
///
/// `raw` must point at a live tasklet allocation.
pub(crate) unsafe fn add_ref(raw: NonNull<RawTasklet>) {
    // Safety: ensured by caller.
    let header = unsafe { header_prefix(raw) };
    header.refs.fetch_add(1, Ordering::Relaxed);
}

/// Drops one reference, freeing the allocation when it was the last.
///
/// # Safety
///
/// `raw` must point at a live tasklet allocation and the caller must own
/// one of its references.
pub(crate) unsafe fn drop_ref(raw: NonNull<RawTasklet>) {
    // Safety: ensured by caller.
    let header = unsafe { header_prefix(raw) };
    if header.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        let destroy = header.destroy;
        // Safety: we held the last reference.
        unsafe { destroy(raw) }
    }
}

/// The tasklet currently executing on this thread, recovered from the
/// running fiber's binding slot.
pub(crate) fn current_raw() -> Option<NonNull<RawTasklet>> {
    let fiber = Fiber::current()?;
    // Safety: the current fiber pointer is valid while this thread runs on
    // it.
    let tasklet = unsafe { fiber.as_ref().bound_tasklet() };
    NonNull::new(tasklet.cast::<RawTasklet>())
}

/// Returns whether the calling code is running on a tasklet fiber (as
/// opposed to a worker's scheduler context or a foreign thread).
pub fn in_tasklet_context() -> bool {
    current_raw().is_some()
}
