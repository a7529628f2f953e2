// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU64, Ordering};

/// A bounded lock-free multi-producer multi-consumer FIFO queue.
///
/// Each slot carries a monotonically increasing *turn* counter that encodes
/// whose move it is: a producer may write slot `i` when the turn equals
/// `2 * (head / capacity)` and a consumer may read it when the turn equals
/// `2 * (tail / capacity) + 1`. The head and tail counters never wrap in
/// practice (they are 64-bit), so the queue is immune to ABA.
///
/// The fast path is wait-free; a full or empty queue is reported to the
/// caller rather than blocked on.
///
/// Algorithm from: https://github.com/rigtorp/MPMCQueue
pub struct MpmcQueue<T> {
    slots: Box<[Slot<T>]>,
    head: AtomicU64,
    tail: AtomicU64,
}

struct Slot<T> {
    turn: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: slot access is serialised by the turn protocol; a value is moved
// in by exactly one producer and out by exactly one consumer.
unsafe impl<T: Send> Send for MpmcQueue<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Creates a queue with the given capacity, which must be a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "MpmcQueue capacity must be a power of two"
        );

        let slots = (0..capacity)
            .map(|_| Slot {
                turn: AtomicU64::new(0),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            slots,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    #[inline]
    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Attempts to enqueue a value, returning it back if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the value in the `Err` variant when the queue is full.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let capacity = self.capacity();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[(head % capacity) as usize];
            if slot.turn.load(Ordering::Acquire) == 2 * (head / capacity) {
                match self
                    .head
                    .compare_exchange(head, head + 1, Ordering::Relaxed, Ordering::Acquire)
                {
                    Ok(_) => {
                        // Safety: winning the CAS on the head counter for
                        // this turn grants exclusive write access to the
                        // slot until the turn store below publishes it.
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        slot.turn
                            .store(2 * (head / capacity) + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => head = current,
                }
            } else {
                let prev = head;
                head = self.head.load(Ordering::Acquire);
                if head == prev {
                    // The slot a full capacity behind us has not been
                    // consumed yet.
                    return Err(value);
                }
            }
        }
    }

    /// Attempts to dequeue a value, returning `None` if the queue is empty.
    pub fn dequeue(&self) -> Option<T> {
        let capacity = self.capacity();
        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[(tail % capacity) as usize];
            if slot.turn.load(Ordering::Acquire) == 2 * (tail / capacity) + 1 {
                match self
                    .tail
                    .compare_exchange(tail, tail + 1, Ordering::Relaxed, Ordering::Acquire)
                {
                    Ok(_) => {
                        // Safety: winning the CAS on the tail counter for
                        // this turn grants exclusive read access to the
                        // slot; the producer's release store to the turn
                        // makes the value visible.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.turn
                            .store(2 * (tail / capacity) + 2, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => tail = current,
                }
            } else {
                let prev = tail;
                tail = self.tail.load(Ordering::Acquire);
                if tail == prev {
                    return None;
                }
            }
        }
    }

    /// Returns whether the queue appears empty.
    ///
    /// The answer is approximate under concurrent use.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) <= self.tail.load(Ordering::Relaxed)
    }

    /// Returns the apparent number of queued values.
    ///
    /// The answer is approximate under concurrent use.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        usize::try_from(head.saturating_sub(tail)).unwrap_or(0)
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        // Drain any values still in flight so their destructors run.
        while self.dequeue().is_some() {}
    }
}

impl<T> fmt::Debug for MpmcQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpmcQueue")
            .field("capacity", &self.slots.len())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let queue = MpmcQueue::with_capacity(8);
        for i in 0..8 {
            queue.enqueue(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(queue.dequeue(), Some(i));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn full_queue_reports_failure() {
        let queue = MpmcQueue::with_capacity(4);
        for i in 0..4 {
            queue.enqueue(i).unwrap();
        }
        assert_eq!(queue.enqueue(99), Err(99));
        assert_eq!(queue.dequeue(), Some(0));
        queue.enqueue(99).unwrap();
    }

    #[test]
    fn wraparound_reuses_slots() {
        let queue = MpmcQueue::with_capacity(2);
        for round in 0..100u64 {
            queue.enqueue(round).unwrap();
            queue.enqueue(round + 1000).unwrap();
            assert_eq!(queue.dequeue(), Some(round));
            assert_eq!(queue.dequeue(), Some(round + 1000));
        }
    }

    #[test]
    fn drops_queued_values() {
        struct Counted(Arc<std::sync::atomic::AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let queue = MpmcQueue::with_capacity(4);
        queue.enqueue(Counted(drops.clone())).map_err(|_| ()).unwrap();
        queue.enqueue(Counted(drops.clone())).map_err(|_| ()).unwrap();
        drop(queue);
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn concurrent_sum_is_preserved() {
        // Four producers each push 0..N while four consumers pop until the
        // full count has been seen. No item may be lost or duplicated, so
        // the grand total must equal 4 * N * (N - 1) / 2.
        const N: u64 = 1_000_000;
        const PRODUCERS: u64 = 4;

        let queue = Arc::new(MpmcQueue::with_capacity(1024));
        let remaining = Arc::new(std::sync::atomic::AtomicU64::new(N * PRODUCERS));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..N {
                        let mut value = i;
                        while let Err(v) = queue.enqueue(value) {
                            value = v;
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let remaining = remaining.clone();
                thread::spawn(move || {
                    let mut sum = 0u64;
                    loop {
                        if let Some(value) = queue.dequeue() {
                            sum += value;
                            remaining.fetch_sub(1, Ordering::Relaxed);
                        } else if remaining.load(Ordering::Relaxed) == 0 {
                            return sum;
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        let total: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(total, PRODUCERS * (N * (N - 1) / 2));
    }
}
