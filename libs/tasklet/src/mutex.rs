// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

// TODO: Only wake one waiter upon unlock to avoid the thundering herd. This
//       is hard because unlocking swaps the whole list out; waking one would
//       need to push the rest back while racing new lockers.

use crate::scheduler;
use crate::tasklet::{self, RawTasklet};
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering, fence};

fn unlocked_sentinel() -> *mut RawTasklet {
    usize::MAX as *mut RawTasklet
}

/// A tasklet-aware mutual exclusion lock.
///
/// The single atomic word is the entire state: the unlocked sentinel, null
/// (locked, no waiters) or the head of an intrusive stack of suspended
/// tasklets (locked, contended). Contended lockers push themselves onto the
/// stack and suspend; unlocking swaps the whole stack out and reschedules
/// every waiter, which then race for the fast path again. Fairness is not
/// guaranteed; in practice work stealing keeps starvation bounded.
pub struct Mutex<T> {
    wait_list: AtomicPtr<RawTasklet>,
    data: UnsafeCell<T>,
}

// Safety: the lock protocol hands out exclusive access to the data.
unsafe impl<T: Send> Send for Mutex<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            wait_list: AtomicPtr::new(unlocked_sentinel()),
            data: UnsafeCell::new(data),
        }
    }

    /// Attempts the uncontended fast path.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.wait_list
            .compare_exchange(
                unlocked_sentinel(),
                ptr::null_mut(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
            .then(|| MutexGuard { mutex: self })
    }

    /// Acquires the lock, suspending the current tasklet on contention.
    ///
    /// On a non-tasklet thread contention degrades to a spin loop on the
    /// fast path.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            match self.wait_list.compare_exchange(
                unlocked_sentinel(),
                ptr::null_mut(),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return MutexGuard { mutex: self },
                Err(observed) => {
                    let Some(current) = tasklet::current_raw() else {
                        core::hint::spin_loop();
                        continue;
                    };

                    if observed == unlocked_sentinel() {
                        // Raced with an unlock; retry the fast path.
                        continue;
                    }

                    // Safety: the current tasklet is alive and not linked
                    // into any other wait list while it is running.
                    unsafe {
                        current.as_ref().next.store(observed, Ordering::Relaxed);
                    }
                    if self
                        .wait_list
                        .compare_exchange(
                            observed,
                            current.as_ptr(),
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        // Parked; the unlocker will reschedule us.
                        scheduler::suspend();
                    } else {
                        // Either the mutex was unlocked or another tasklet
                        // won the race into the wait list; retry from the
                        // top either way.
                        // Safety: as above.
                        unsafe {
                            current.as_ref().next.store(ptr::null_mut(), Ordering::Relaxed);
                        }
                        fence(Ordering::Release);
                    }
                }
            }
        }
    }

    fn unlock(&self) {
        // Swap the waiter list with the unlocked sentinel.
        let mut waiter = self.wait_list.swap(unlocked_sentinel(), Ordering::AcqRel);
        assert!(
            waiter != unlocked_sentinel(),
            "unlocked a mutex that was not locked"
        );

        // Wake every waiter; they re-race for the lock.
        while let Some(current) = NonNull::new(waiter) {
            // Unlink before rescheduling.
            // Safety: parked tasklets on the list are alive.
            waiter = unsafe {
                current
                    .as_ref()
                    .next
                    .swap(ptr::null_mut(), Ordering::Relaxed)
            };
            scheduler::schedule_raw(current);
        }
    }

    /// Returns a mutable reference to the data; no locking is needed since
    /// `&mut self` proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> Drop for Mutex<T> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.wait_list.load(Ordering::Relaxed),
            unlocked_sentinel(),
            "mutex dropped while locked"
        );
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => s.field("data", &*guard),
            None => s.field("data", &"<locked>"),
        };
        s.finish()
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: holding the guard means holding the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: see Deref.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
