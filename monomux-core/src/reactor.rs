// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A single-threaded, epoll-backed event reactor.
//!
//! The server and the client each own exactly one `Reactor`. Nothing
//! in this crate spawns a thread to do I/O; the only blocking call
//! anywhere is [`Reactor::wait`].

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use tracing::trace;

/// A single registered fd's readiness, as handed back by [`Reactor::wait`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Copy, Clone, Debug, Default)]
struct Interest {
    read: bool,
    write: bool,
}

impl Interest {
    fn epoll_flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

/// Wraps an `epoll` instance plus a FIFO queue of synthetically
/// scheduled events. Scheduled events are always drained, in order,
/// before any new system events are polled for -- this lets internal
/// state transitions (a promotion completing, a channel being torn
/// down) re-enter the same dispatch loop the real I/O events go
/// through, without a second code path.
pub struct Reactor {
    epoll: Epoll,
    interests: HashMap<RawFd, Interest>,
    scheduled: VecDeque<Event>,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::empty()).context("creating epoll instance")?;
        Ok(Reactor { epoll, interests: HashMap::new(), scheduled: VecDeque::new() })
    }

    /// Registers or updates interest in `fd`. Idempotent: calling
    /// this again for an already-registered fd just updates its
    /// interest set.
    pub fn listen(&mut self, fd: RawFd, read: bool, write: bool) -> Result<()> {
        let interest = Interest { read, write };
        let event = EpollEvent::new(interest.epoll_flags(), fd as u64);
        if self.interests.contains_key(&fd) {
            self.epoll.modify(fd_to_borrowed(fd), &mut { event }).context("epoll_ctl(MOD)")?;
        } else {
            self.epoll.add(fd_to_borrowed(fd), event).context("epoll_ctl(ADD)")?;
        }
        self.interests.insert(fd, interest);
        Ok(())
    }

    /// Deregisters `fd`. Idempotent: stopping an fd that isn't
    /// registered is not an error.
    pub fn stop(&mut self, fd: RawFd) -> Result<()> {
        if self.interests.remove(&fd).is_some() {
            // An already-closed fd is automatically dropped by the
            // kernel from the epoll set; ENOENT here just means we
            // lost the race, which is fine.
            match self.epoll.delete(fd_to_borrowed(fd)) {
                Ok(()) => {}
                Err(nix::errno::Errno::ENOENT) => {}
                Err(e) => return Err(e).context("epoll_ctl(DEL)"),
            }
        }
        self.scheduled.retain(|ev| ev.fd != fd);
        Ok(())
    }

    /// Injects a synthetic readiness event for `fd`, to be returned
    /// by the next [`Reactor::wait`] ahead of any real system events.
    /// `fd` need not be registered with epoll at all.
    pub fn schedule(&mut self, fd: RawFd, readable: bool, writable: bool) {
        self.scheduled.push_back(Event { fd, readable, writable });
    }

    /// Blocks until at least one event is ready, or indefinitely if
    /// `timeout` is `None`. Returns scheduled events first; once those
    /// are drained, polls the kernel. A zero-length result is legal
    /// (the underlying `epoll_wait` was interrupted by a signal) and
    /// is not an error. Any other error is fatal: the caller should
    /// shut down rather than keep looping.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        if !self.scheduled.is_empty() {
            return Ok(self.scheduled.drain(..).collect());
        }

        let mut raw_events = [EpollEvent::empty(); 64];
        let timeout_ms = match timeout {
            Some(d) => nix::sys::epoll::EpollTimeout::try_from(d.as_millis() as isize)
                .unwrap_or(nix::sys::epoll::EpollTimeout::NONE),
            None => nix::sys::epoll::EpollTimeout::NONE,
        };
        let n = match self.epoll.wait(&mut raw_events, timeout_ms) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => {
                trace!("epoll_wait interrupted by signal");
                0
            }
            Err(e) => return Err(e).context("epoll_wait"),
        };

        let mut events = Vec::with_capacity(n);
        for raw in &raw_events[..n] {
            let fd = raw.data() as RawFd;
            let flags = raw.events();
            events.push(Event {
                fd,
                readable: flags.intersects(
                    EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR,
                ),
                writable: flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLERR),
            });
        }
        Ok(events)
    }
}

fn fd_to_borrowed(fd: RawFd) -> std::os::fd::BorrowedFd<'static> {
    // Safety: the fd outlives the epoll_ctl call that uses this
    // borrow; the Reactor never outlives the fds it has registered
    // (owners deregister via `stop` before dropping their `Handle`).
    unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduled_events_are_returned_before_polling() {
        let mut r = Reactor::new().unwrap();
        r.schedule(7, true, false);
        r.schedule(9, false, true);
        let events = r.wait(Some(Duration::from_millis(0))).unwrap();
        assert_eq!(events, vec![
            Event { fd: 7, readable: true, writable: false },
            Event { fd: 9, readable: false, writable: true },
        ]);
    }

    #[test]
    fn stop_is_idempotent_on_unregistered_fd() {
        let mut r = Reactor::new().unwrap();
        assert!(r.stop(123).is_ok());
        assert!(r.stop(123).is_ok());
    }

    #[test]
    fn stop_drops_pending_scheduled_events_for_that_fd() {
        let mut r = Reactor::new().unwrap();
        r.schedule(5, true, false);
        r.stop(5).unwrap();
        let events = r.wait(Some(Duration::from_millis(0))).unwrap();
        assert!(events.is_empty());
    }
}
