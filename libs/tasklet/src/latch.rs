// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::promise::Promise;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// A downwards counter tasklets can block on until it reaches zero.
///
/// The counter reaches zero at most once; the embedded promise resolves the
/// race between a waiter checking the count and the final arrival firing
/// the wakeup.
pub struct Latch {
    value: AtomicU32,
    promise: Promise<()>,
}

impl Latch {
    /// Creates a latch expecting `expected` arrivals.
    pub fn new(expected: u32) -> Self {
        Self {
            value: AtomicU32::new(expected),
            promise: Promise::new(),
        }
    }

    /// Decrements the count by `update` and blocks until it reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if `update` is greater than the remaining count.
    pub fn arrive(&self, update: u32) {
        self.count_down(update);
        self.wait();
    }

    /// Decrements the count by `update` without blocking. The waiters are
    /// woken when the count hits zero.
    ///
    /// # Panics
    ///
    /// Panics if `update` is greater than the remaining count.
    pub fn count_down(&self, update: u32) {
        let value = self.value.fetch_sub(update, Ordering::AcqRel);
        assert!(value >= update, "latch counted below zero");
        if value == update {
            tracing::trace!("latch reached zero, waking waiters");
            self.promise.fulfill(());
        }
    }

    /// Returns whether the count has reached zero. Never blocks.
    pub fn try_wait(&self) -> bool {
        self.value.load(Ordering::Acquire) == 0
    }

    /// Blocks until the count reaches zero; returns immediately if it
    /// already has.
    pub fn wait(&self) {
        if self.try_wait() {
            return;
        }
        // The promise arbitrates the race between this check and the final
        // count_down: a waiter that loses is scheduled immediately instead
        // of parked.
        self.promise.wait();
    }
}

impl fmt::Debug for Latch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch")
            .field("value", &self.value.load(Ordering::Relaxed))
            .finish()
    }
}
