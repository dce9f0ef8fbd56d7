// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cancellable blocking wait on a file descriptor.
//!
//! A [`PollFd`] multiplexes the watched descriptor with an internal [`EventFd`] so that a thread
//! blocked in [`PollFd::poll`] can be released from another thread without closing the
//! descriptor under its feet.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

const FILE_TOKEN: u64 = 0;
const CANCEL_TOKEN: u64 = 1;

/// Errors associated with [`PollFd`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum PollFdError {
    /// Failed to create the epoll instance: {0}
    EpollCreate(io::Error),
    /// Failed to register fd {0} with epoll: {1}
    EpollCtl(RawFd, io::Error),
    /// Failed while waiting on epoll: {0}
    EpollWait(io::Error),
    /// Failed to create the cancellation event: {0}
    EventFdCreate(io::Error),
    /// Failed to signal the cancellation event: {0}
    EventFdWrite(io::Error),
    /// Failed to consume the cancellation event: {0}
    EventFdRead(io::Error),
    /// Poll error condition on fd {0}
    ErrorCondition(RawFd),
    /// Poll hang up on fd {0}
    HangUp(RawFd),
}

/// Waits for a file descriptor to become readable, or for [`PollFd::cancel`] to be called.
#[derive(Debug)]
pub struct PollFd {
    fd: RawFd,
    epoll: Epoll,
    cancel_evt: EventFd,
}

impl PollFd {
    /// Creates a wait on `fd` for the given `events`.
    ///
    /// The descriptor is borrowed: it must outlive the returned `PollFd`.
    pub fn new(fd: RawFd, events: EventSet) -> Result<Self, PollFdError> {
        let epoll = Epoll::new().map_err(PollFdError::EpollCreate)?;
        let cancel_evt = EventFd::new(EFD_NONBLOCK).map_err(PollFdError::EventFdCreate)?;

        epoll
            .ctl(
                ControlOperation::Add,
                fd,
                EpollEvent::new(events, FILE_TOKEN),
            )
            .map_err(|err| PollFdError::EpollCtl(fd, err))?;
        epoll
            .ctl(
                ControlOperation::Add,
                cancel_evt.as_raw_fd(),
                EpollEvent::new(EventSet::IN, CANCEL_TOKEN),
            )
            .map_err(|err| PollFdError::EpollCtl(cancel_evt.as_raw_fd(), err))?;

        Ok(PollFd {
            fd,
            epoll,
            cancel_evt,
        })
    }

    /// Blocks until the descriptor is ready or the wait is cancelled.
    ///
    /// Returns `Ok(true)` if the watched descriptor is ready and `Ok(false)` if the wait was
    /// cancelled. A pending cancellation is consumed by the call that observes it and takes
    /// priority over descriptor readiness.
    pub fn poll(&self) -> Result<bool, PollFdError> {
        let mut events = [EpollEvent::default(), EpollEvent::default()];

        let count = loop {
            match self.epoll.wait(-1, &mut events) {
                Ok(count) => break count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(PollFdError::EpollWait(err)),
            }
        };

        let ready = &events[..count];

        if ready.iter().any(|event| event.data() == CANCEL_TOKEN) {
            match self.cancel_evt.read() {
                Ok(_) => {}
                // Another poll() already consumed the counter.
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(PollFdError::EventFdRead(err)),
            }
            return Ok(false);
        }

        let mut readable = false;

        for event in ready.iter().filter(|event| event.data() == FILE_TOKEN) {
            let event_set = event.event_set();

            if event_set.contains(EventSet::ERROR) {
                return Err(PollFdError::ErrorCondition(self.fd));
            }
            if event_set.contains(EventSet::HANG_UP) {
                return Err(PollFdError::HangUp(self.fd));
            }

            readable = true;
        }

        Ok(readable)
    }

    /// Releases the thread blocked in [`PollFd::poll`], or the next caller if none is blocked.
    pub fn cancel(&self) -> Result<(), PollFdError> {
        self.cancel_evt.write(1).map_err(PollFdError::EventFdWrite)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_poll_readable() {
        let evt = EventFd::new(EFD_NONBLOCK).unwrap();
        let poll_fd = PollFd::new(evt.as_raw_fd(), EventSet::IN).unwrap();

        evt.write(1).unwrap();
        assert!(poll_fd.poll().unwrap());

        // Level triggered: stays ready until the event is consumed.
        assert!(poll_fd.poll().unwrap());
        evt.read().unwrap();
    }

    #[test]
    fn test_cancel_before_poll() {
        let evt = EventFd::new(EFD_NONBLOCK).unwrap();
        let poll_fd = PollFd::new(evt.as_raw_fd(), EventSet::IN).unwrap();

        poll_fd.cancel().unwrap();
        assert!(!poll_fd.poll().unwrap());
    }

    #[test]
    fn test_cancel_has_priority() {
        let evt = EventFd::new(EFD_NONBLOCK).unwrap();
        let poll_fd = PollFd::new(evt.as_raw_fd(), EventSet::IN).unwrap();

        evt.write(1).unwrap();
        poll_fd.cancel().unwrap();

        assert!(!poll_fd.poll().unwrap());
        // The cancellation was consumed, the fd is still ready.
        assert!(poll_fd.poll().unwrap());
    }

    #[test]
    fn test_cancel_from_other_thread() {
        let evt = EventFd::new(EFD_NONBLOCK).unwrap();
        let poll_fd = Arc::new(PollFd::new(evt.as_raw_fd(), EventSet::IN).unwrap());

        let waiter = {
            let poll_fd = poll_fd.clone();
            thread::spawn(move || poll_fd.poll().unwrap())
        };

        thread::sleep(Duration::from_millis(50));
        poll_fd.cancel().unwrap();

        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_invalid_fd() {
        let res = PollFd::new(-1, EventSet::IN);
        assert!(matches!(res, Err(PollFdError::EpollCtl(-1, _))));
    }
}
