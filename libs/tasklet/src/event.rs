// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::io;
use std::os::fd::RawFd;

/// A kernel-backed counting event (an eventfd).
///
/// Signalling adds to the counter and makes the descriptor readable;
/// consuming reads the counter back out and resets it. The I/O worker
/// waits on events with epoll.
pub struct Event {
    fd: RawFd,
}

// Safety: eventfd reads and writes are atomic kernel operations.
unsafe impl Send for Event {}
// Safety: see above.
unsafe impl Sync for Event {}

impl Event {
    /// Creates a new event with a zero counter.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the eventfd cannot be created.
    pub fn new() -> io::Result<Self> {
        // Safety: eventfd has no preconditions.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Adds `count` to the event counter, waking any waiter.
    pub fn signal(&self, count: u64) {
        let bytes = count.to_ne_bytes();
        // Safety: the fd is open and the buffer is 8 bytes as eventfd
        // requires.
        let ret = unsafe { libc::write(self.fd, bytes.as_ptr().cast(), bytes.len()) };
        debug_assert!(ret == 8 || ret < 0);
    }

    /// Reads the counter, resetting it to zero. Returns zero if the event
    /// was not signalled.
    pub fn consume(&self) -> u64 {
        let mut bytes = [0u8; 8];
        // Safety: the fd is open and the buffer is 8 bytes.
        let ret = unsafe { libc::read(self.fd, bytes.as_mut_ptr().cast(), bytes.len()) };
        if ret == 8 { u64::from_ne_bytes(bytes) } else { 0 }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // Safety: we own the fd.
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("fd", &self.fd).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_and_consume() {
        let event = Event::new().unwrap();
        assert_eq!(event.consume(), 0);
        event.signal(3);
        event.signal(4);
        assert_eq!(event.consume(), 7);
        assert_eq!(event.consume(), 0);
    }
}
