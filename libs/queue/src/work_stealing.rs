// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI64, AtomicPtr, Ordering, fence};

/// A bounded work-stealing deque of raw pointers.
///
/// The queue has a single owner which pushes and pops at the head; any other
/// thread may steal from the tail. The owner's fast path involves no CAS at
/// all; only the race for the last remaining element is resolved with a CAS
/// on the tail, the loser backing off empty-handed.
///
/// The element type is a raw pointer because that is the only shape the
/// scheduler needs (tasklets are pinned heap allocations) and it keeps the
/// slots individually atomic, which stealing requires.
///
/// Algorithm from: https://fzn.fr/readings/ppopp13.pdf
pub struct WorkStealingQueue<T> {
    slots: Box<[AtomicPtr<T>]>,
    head: AtomicI64,
    tail: AtomicI64,
}

// Safety: the deque hands out raw pointers without touching the pointees;
// ownership of the pointee stays with the caller.
unsafe impl<T> Send for WorkStealingQueue<T> {}
// Safety: see above.
unsafe impl<T> Sync for WorkStealingQueue<T> {}

impl<T> WorkStealingQueue<T> {
    /// Creates a deque with the given capacity, which must be a power of two
    /// so that slot indexing reduces to a mask.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "WorkStealingQueue capacity must be a power of two"
        );

        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(core::ptr::null_mut()))
            .collect();

        Self {
            slots,
            head: AtomicI64::new(0),
            tail: AtomicI64::new(0),
        }
    }

    #[inline]
    fn slot(&self, index: i64) -> &AtomicPtr<T> {
        &self.slots[index.rem_euclid(self.slots.len() as i64) as usize]
    }

    /// Pushes an element at the head. Only the owning thread may call this.
    ///
    /// Returns `false` if the deque is full.
    #[must_use]
    pub fn enqueue(&self, elem: NonNull<T>) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head - tail >= self.slots.len() as i64 {
            return false;
        }

        self.slot(head).store(elem.as_ptr(), Ordering::Relaxed);
        fence(Ordering::Release);
        self.head.store(head + 1, Ordering::Relaxed);
        true
    }

    /// Pops the most recently pushed element. Only the owning thread may
    /// call this.
    pub fn dequeue(&self) -> Option<NonNull<T>> {
        let index = self.head.fetch_sub(1, Ordering::Relaxed) - 1;
        fence(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::Relaxed);

        if tail > index {
            // Deque was empty, restore the head index.
            self.head.store(index + 1, Ordering::Relaxed);
            return None;
        }

        let elem = self.slot(index).load(Ordering::Relaxed);
        if tail != index {
            // Not the last element, no thief can reach it.
            return NonNull::new(elem);
        }

        // Exactly one element left; race any concurrent steal for it.
        let won = self
            .tail
            .compare_exchange(tail, tail + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.head.store(index + 1, Ordering::Relaxed);
        if won { NonNull::new(elem) } else { None }
    }

    /// Steals the oldest element. Any thread may call this.
    pub fn steal(&self) -> Option<NonNull<T>> {
        let tail = self.tail.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let head = self.head.load(Ordering::Acquire);

        if tail >= head {
            return None;
        }

        let elem = self.slot(tail).load(Ordering::Relaxed);
        if self
            .tail
            .compare_exchange(tail, tail + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            // Lost the race against the owner or another thief.
            return None;
        }
        NonNull::new(elem)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) <= self.tail.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        usize::try_from(head - tail).unwrap_or(0)
    }
}

impl<T> fmt::Debug for WorkStealingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkStealingQueue")
            .field("capacity", &self.slots.len())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use std::thread;

    fn leak(value: u64) -> NonNull<u64> {
        NonNull::new(Box::into_raw(Box::new(value))).unwrap()
    }

    // Safety: only call on pointers produced by `leak` that have not been
    // reclaimed yet.
    unsafe fn reclaim(ptr: NonNull<u64>) -> u64 {
        *unsafe { Box::from_raw(ptr.as_ptr()) }
    }

    #[test]
    fn owner_pop_is_lifo() {
        let queue = WorkStealingQueue::with_capacity(8);
        let (a, b) = (leak(1), leak(2));
        assert!(queue.enqueue(a));
        assert!(queue.enqueue(b));
        // Safety: pointers came from `leak` above.
        unsafe {
            assert_eq!(reclaim(queue.dequeue().unwrap()), 2);
            assert_eq!(reclaim(queue.dequeue().unwrap()), 1);
        }
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn steal_is_fifo() {
        let queue = WorkStealingQueue::with_capacity(8);
        assert!(queue.enqueue(leak(1)));
        assert!(queue.enqueue(leak(2)));
        // Safety: pointers came from `leak` above.
        unsafe {
            assert_eq!(reclaim(queue.steal().unwrap()), 1);
            assert_eq!(reclaim(queue.steal().unwrap()), 2);
        }
        assert!(queue.steal().is_none());
    }

    #[test]
    fn full_deque_rejects() {
        let queue = WorkStealingQueue::with_capacity(2);
        assert!(queue.enqueue(leak(1)));
        assert!(queue.enqueue(leak(2)));
        let extra = leak(3);
        assert!(!queue.enqueue(extra));
        // Safety: all three pointers came from `leak` above and the rejected
        // one was never stored.
        unsafe {
            reclaim(extra);
            reclaim(queue.dequeue().unwrap());
            reclaim(queue.dequeue().unwrap());
        }
    }

    #[test]
    fn concurrent_steal_no_loss_no_duplicates() {
        // One owner pushes and pops while three thieves steal; every element
        // must be seen exactly once across all four threads.
        const N: u64 = 100_000;

        let queue = Arc::new(WorkStealingQueue::with_capacity(1024));
        let taken = Arc::new(AtomicU64::new(0));
        let sum = Arc::new(AtomicU64::new(0));

        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                let taken = taken.clone();
                let sum = sum.clone();
                thread::spawn(move || {
                    while taken.load(Ordering::Relaxed) < N {
                        if let Some(ptr) = queue.steal() {
                            // Safety: stolen pointers were produced by
                            // `leak` on the owner thread.
                            sum.fetch_add(unsafe { reclaim(ptr) }, Ordering::Relaxed);
                            taken.fetch_add(1, Ordering::Relaxed);
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for i in 0..N {
            let ptr = leak(i);
            while !queue.enqueue(ptr) {
                if let Some(popped) = queue.dequeue() {
                    // Safety: popped pointers were produced by `leak`.
                    sum.fetch_add(unsafe { reclaim(popped) }, Ordering::Relaxed);
                    taken.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        while let Some(popped) = queue.dequeue() {
            // Safety: popped pointers were produced by `leak`.
            sum.fetch_add(unsafe { reclaim(popped) }, Ordering::Relaxed);
            taken.fetch_add(1, Ordering::Relaxed);
        }

        for thief in thieves {
            thief.join().unwrap();
        }
        assert_eq!(taken.load(Ordering::Relaxed), N);
        assert_eq!(sum.load(Ordering::Relaxed), N * (N - 1) / 2);
    }
}
