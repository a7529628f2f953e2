// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Fatal scheduler bring-up failures.
///
/// These are reported so that embedders can log them, but there is no
/// recovery story: the runtime aborts the process when it runs into one
/// mid-flight.
#[derive(Debug)]
pub enum SchedulerError {
    ThreadCreationFailed(std::io::Error),
    FiberAllocationFailed(std::io::Error),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::ThreadCreationFailed(err) => {
                write!(f, "failed to create worker thread: {err}")
            }
            SchedulerError::FiberAllocationFailed(err) => {
                write!(f, "failed to allocate fiber: {err}")
            }
        }
    }
}

impl core::error::Error for SchedulerError {}
