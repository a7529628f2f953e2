// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler;
use crate::tasklet::{self, RawTasklet};
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

/// Sentinel stored in the wait list head once the promise has fired.
pub(crate) fn fulfilled_sentinel() -> *mut RawTasklet {
    usize::MAX as *mut RawTasklet
}

/// A single-fire synchronisation point carrying an optional value.
///
/// The wait list head is either the fulfilled sentinel or a lock-free stack
/// of parked tasklets linked through their intrusive `next` pointers. A
/// tasklet can sit in at most one wait list at a time.
///
/// Fulfilling swaps the stack out with the sentinel and reschedules every
/// retrieved waiter; adding a waiter races against that swap safely, and a
/// waiter that loses (the promise is already fulfilled) is reported back to
/// the caller so it can skip suspending.
pub struct Promise<T> {
    wait_list: AtomicPtr<RawTasklet>,
    value: UnsafeCell<Option<T>>,
}

// Safety: the value slot is written once, before the release swap of the
// wait list head, and only read after observing the fulfilled sentinel.
unsafe impl<T: Send> Send for Promise<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Promise<T> {}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            wait_list: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(None),
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.wait_list.load(Ordering::Acquire) == fulfilled_sentinel()
    }

    /// Pushes `waiter` onto the wait list.
    ///
    /// Returns `false` if the promise was already fulfilled; the waiter was
    /// *not* queued and the caller must not suspend.
    pub(crate) fn add_waiter(&self, waiter: NonNull<RawTasklet>) -> bool {
        let mut head = self.wait_list.load(Ordering::Relaxed);
        loop {
            if head == fulfilled_sentinel() {
                // Make sure the link does not dangle into a dead list.
                // Safety: the waiter is a live tasklet owned by the caller.
                unsafe {
                    waiter.as_ref().next.store(ptr::null_mut(), Ordering::Relaxed);
                }
                return false;
            }
            // Safety: as above.
            unsafe {
                waiter.as_ref().next.store(head, Ordering::Relaxed);
            }
            match self.wait_list.compare_exchange_weak(
                head,
                waiter.as_ptr(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => head = current,
            }
        }
    }

    /// Fulfills the promise with `value` and reschedules every waiter.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already fulfilled; a promise fires exactly
    /// once.
    pub fn fulfill(&self, value: T) {
        // Safety: the swap below publishes the write with release ordering;
        // readers only look after observing the sentinel.
        unsafe {
            *self.value.get() = Some(value);
        }
        self.wake_all();
    }

    fn wake_all(&self) {
        // Atomically swap the list with the fulfilled sentinel.
        let mut waiter = self.wait_list.swap(fulfilled_sentinel(), Ordering::AcqRel);
        assert!(
            waiter != fulfilled_sentinel(),
            "promise fulfilled more than once"
        );

        while let Some(tasklet) = NonNull::new(waiter) {
            // Unlink before rescheduling: the moment the tasklet is queued
            // it may run and reuse its link field.
            // Safety: tasklets on the wait list are parked and alive.
            waiter = unsafe {
                tasklet
                    .as_ref()
                    .next
                    .swap(ptr::null_mut(), Ordering::Relaxed)
            };
            scheduler::schedule_raw(tasklet);
        }
    }

    /// Queues `tasklet` to be scheduled on fulfillment, or immediately if
    /// the promise has already fired.
    pub(crate) fn wake_on_fulfillment(&self, tasklet: NonNull<RawTasklet>) {
        if !self.add_waiter(tasklet) {
            scheduler::schedule_raw(tasklet);
        }
    }

    /// Blocks the current tasklet until the promise is fulfilled.
    ///
    /// Returns immediately if it already fired. On a non-tasklet thread
    /// this degrades to a spin-yield loop.
    pub fn wait(&self) {
        if let Some(current) = tasklet::current_raw() {
            if self.add_waiter(current) {
                scheduler::suspend();
            }
        } else {
            while !self.is_fulfilled() {
                std::thread::yield_now();
            }
        }
    }

    /// Clones the fulfilled value out of the promise.
    ///
    /// # Panics
    ///
    /// Panics if the promise has not been fulfilled yet.
    pub fn value(&self) -> T
    where
        T: Clone,
    {
        assert!(self.is_fulfilled(), "promise value read before fulfillment");
        // Safety: fulfillment wrote the value before the release swap we
        // just observed with acquire ordering, and nobody writes it again.
        unsafe { (*self.value.get()).clone().expect("fulfilled without value") }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("fulfilled", &self.is_fulfilled())
            .finish()
    }
}
