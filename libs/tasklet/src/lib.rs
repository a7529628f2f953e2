// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The vane tasklet runtime: a fiber-based work-stealing cooperative
//! scheduler with promises, futures, latches, a tasklet-aware mutex and an
//! asynchronous I/O completion path.
//!
//! A *tasklet* is a unit of cooperative work running on a [`Fiber`]
//! borrowed from its worker. Suspension points are explicit — [`yield_now`],
//! [`Future::wait`], [`Latch::wait`], [`Mutex::lock`] under contention and
//! I/O submission — nothing suspends implicitly. There is no preemption and
//! no cancellation; a scheduled computation always runs to completion.
//!
//! ```no_run
//! use vane_tasklet::{Scheduler, schedule};
//!
//! let total = Scheduler::new().run(|| {
//!     let a = schedule(|| 2 + 2);
//!     let b = schedule(|| 30 + 8);
//!     a.wait() + b.wait()
//! });
//! assert_eq!(total, 42);
//! ```
//!
//! [`Fiber`]: vane_fiber::Fiber

mod error;
mod event;
mod future;
mod io;
mod latch;
mod mutex;
mod promise;
mod scheduler;
mod tasklet;

pub use error::SchedulerError;
pub use event::Event;
pub use future::Future;
pub use io::{IoRequest, IoRequestKind, IoResult, submit};
pub use latch::Latch;
pub use mutex::{Mutex, MutexGuard};
pub use promise::Promise;
pub use scheduler::{Scheduler, SchedulerHandle, schedule, suspend, yield_now};
pub use tasklet::in_tasklet_context;
