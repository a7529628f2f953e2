// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler;
use crate::tasklet::{self, PromiseHeader};
use core::fmt;
use core::ptr::NonNull;

/// A handle to the eventual result of a scheduled tasklet.
///
/// Futures are cheap refcounted handles to the tasklet's promise. The
/// default-constructed future is *invalid* (it refers to nothing); futures
/// returned by [`schedule`](crate::schedule) and [`Future::and_then`] are
/// valid.
pub struct Future<T> {
    header: Option<NonNull<PromiseHeader<T>>>,
}

// Safety: the header is a refcounted shared allocation whose interior
// synchronisation (promise + atomic refcount) is thread-safe for T: Send.
unsafe impl<T: Send> Send for Future<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Future<T> {}

impl<T> Future<T> {
    /// Takes ownership of one reference to `header`.
    pub(crate) fn from_header(header: NonNull<PromiseHeader<T>>) -> Self {
        Self {
            header: Some(header),
        }
    }

    fn header(&self) -> &PromiseHeader<T> {
        // Safety: a valid future owns a reference that keeps the allocation
        // alive.
        unsafe { self.header.expect("used an invalid future").as_ref() }
    }

    /// Whether this future refers to a tasklet at all.
    pub fn is_valid(&self) -> bool {
        self.header.is_some()
    }

    /// Whether the result is already available. Never blocks.
    pub fn is_complete(&self) -> bool {
        self.header().promise.is_fulfilled()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Blocks the current tasklet until the result is available and returns
    /// it.
    pub fn wait(&self) -> T {
        let promise = &self.header().promise;
        promise.wait();
        promise.value()
    }

    /// Schedules `callable` to run over this future's result once it is
    /// available, returning a future of the mapped value.
    pub fn and_then<U, F>(&self, callable: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let source = self.clone();
        let (raw, chained) = scheduler::new_chained(move || callable(source.wait()));

        // Run the continuation when the source fires (or right away if it
        // already has).
        self.header().promise.wake_on_fulfillment(raw);
        chained
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self { header: None }
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        if let Some(header) = self.header {
            // Safety: we own a reference, so the allocation is alive.
            unsafe { tasklet::add_ref(header.cast()) };
        }
        Self {
            header: self.header,
        }
    }
}

impl<T> Drop for Future<T> {
    fn drop(&mut self) {
        if let Some(header) = self.header.take() {
            // Safety: each future owns exactly one reference.
            unsafe { tasklet::drop_ref(header.cast()) };
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("valid", &self.is_valid())
            .finish()
    }
}
