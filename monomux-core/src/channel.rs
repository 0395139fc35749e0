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

//! Non-blocking read/write buffering over a raw fd.

use std::os::fd::RawFd;
use std::rc::Rc;
use std::cell::RefCell;

use nix::errno::Errno;
use nix::sys::socket;
use nix::unistd;
use tracing::trace;

use crate::consts::{BUF_SIZE, IO_CHUNK_SIZE};
use crate::handle::Handle;

/// What kind of OS resource backs a [`BufferedChannel`]. This mostly
/// changes what "readable" and "writable" mean for the channel, and
/// whether it can `accept()`.
pub enum Kind {
    /// A connected `AF_UNIX` `SOCK_STREAM`. Both directions are
    /// independent; additionally, the listening socket uses this same
    /// kind and is read-readiness-driven for `accept()`.
    DomainSocket,
    /// One end of an anonymous pipe: strictly read-only or
    /// write-only.
    Pipe,
    /// The master side of a pseudo-terminal, shared between a
    /// "read view" (server reading shell output) and a "write view"
    /// (server writing client input), both backed by the same fd via
    /// a shared, reference-counted `Handle`.
    PtyChannel,
}

/// Non-blocking, buffered wrapper around a single fd (or, for
/// `PtyChannel`, a shared fd). Reads that return less than requested,
/// or writes that would block partway through, are not treated as
/// errors: the remainder is queued in a growing back-buffer and
/// retried on the next readiness notification.
pub struct BufferedChannel {
    handle: ChannelHandle,
    kind: Kind,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    failed: bool,
}

enum ChannelHandle {
    Owned(Handle),
    Shared(Rc<RefCell<Handle>>),
}

impl ChannelHandle {
    fn raw(&self) -> RawFd {
        match self {
            ChannelHandle::Owned(h) => h.raw(),
            ChannelHandle::Shared(h) => h.borrow().raw(),
        }
    }
}

impl BufferedChannel {
    pub fn new(handle: Handle, kind: Kind) -> Self {
        BufferedChannel {
            handle: ChannelHandle::Owned(handle),
            kind,
            read_buffer: Vec::with_capacity(BUF_SIZE),
            write_buffer: Vec::new(),
            failed: false,
        }
    }

    /// Builds a channel sharing ownership of `handle` with another
    /// `BufferedChannel` -- used for the two logical views (read side,
    /// write side) over one PTY master fd. Replaces the non-owning
    /// weak-wrap pattern of the original implementation with explicit
    /// shared ownership: the fd is closed once both views are gone.
    pub fn new_shared(handle: Rc<RefCell<Handle>>) -> Self {
        BufferedChannel {
            handle: ChannelHandle::Shared(handle),
            kind: Kind::PtyChannel,
            read_buffer: Vec::with_capacity(BUF_SIZE),
            write_buffer: Vec::new(),
            failed: false,
        }
    }

    pub fn raw(&self) -> RawFd {
        self.handle.raw()
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn set_failed(&mut self) {
        self.failed = true;
    }

    pub fn has_buffered_read(&self) -> bool {
        !self.read_buffer.is_empty()
    }

    pub fn has_buffered_write(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Accepts a connection on a listening `DomainSocket` channel.
    /// Returns `Ok(None)` on `EAGAIN`/`EWOULDBLOCK` (no pending
    /// connection, though the channel was reported readable -- this
    /// can legitimately happen under load), and any other errno is
    /// forwarded for the caller to classify (resource exhaustion vs
    /// fatal).
    pub fn accept(&self) -> Result<Option<Handle>, Errno> {
        match socket::accept(self.raw()) {
            Ok(fd) => Ok(Some(unsafe { Handle::from_raw(fd) })),
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads as much as is currently available into the internal read
    /// buffer, then drains up to `max` bytes of it. A zero-byte read
    /// from the underlying fd (peer closed) sets `failed` and is
    /// reported as `Ok(Vec::new())` with `failed()` now true -- callers
    /// must check `failed()` after any read that returns empty.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        self.fill_read_buffer();
        let take = max.min(self.read_buffer.len());
        self.read_buffer.drain(..take).collect()
    }

    /// Like [`Self::read`], but drains the entire current read buffer
    /// regardless of `max`.
    pub fn read_all_buffered(&mut self) -> Vec<u8> {
        self.fill_read_buffer();
        std::mem::take(&mut self.read_buffer)
    }

    /// Puts `bytes` back at the front of the read buffer, ahead of
    /// anything already buffered. Used by the codec layer to return
    /// an incomplete frame's bytes after peeking at them.
    pub fn unread(&mut self, mut bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        bytes.extend_from_slice(&self.read_buffer);
        self.read_buffer = bytes;
    }

    fn fill_read_buffer(&mut self) {
        if self.failed {
            return;
        }
        loop {
            let mut chunk = vec![0u8; IO_CHUNK_SIZE];
            match unistd::read(self.raw(), &mut chunk) {
                Ok(0) => {
                    self.failed = true;
                    return;
                }
                Ok(n) => {
                    chunk.truncate(n);
                    self.read_buffer.extend_from_slice(&chunk);
                    if n < IO_CHUNK_SIZE {
                        return;
                    }
                    // The kernel handed us a full chunk; there may be
                    // more immediately available. Keep draining so a
                    // single readiness notification doesn't leave data
                    // stranded until the next epoll_wait.
                }
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => return,
                Err(_) => {
                    self.failed = true;
                    return;
                }
            }
        }
    }

    /// Queues `data` for writing, then attempts to flush immediately.
    /// Whatever doesn't fit is kept in the write back-buffer for the
    /// next writable readiness. Returns `data.len()`: every byte
    /// handed to this call is accepted, whether the OS takes it right
    /// away or it sits in the back-buffer for a later flush.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.write_buffer.extend_from_slice(data);
        self.flush_writes();
        data.len()
    }

    /// Attempts to drain the write back-buffer into the fd. Safe to
    /// call speculatively (e.g. on every writable readiness) even if
    /// the buffer is empty.
    pub fn flush_writes(&mut self) {
        if self.failed || self.write_buffer.is_empty() {
            return;
        }
        let mut written = 0;
        while written < self.write_buffer.len() {
            let chunk_end = (written + IO_CHUNK_SIZE).min(self.write_buffer.len());
            match unistd::write(
                unsafe { std::os::fd::BorrowedFd::borrow_raw(self.raw()) },
                &self.write_buffer[written..chunk_end],
            ) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
                Err(Errno::EPIPE) => {
                    self.failed = true;
                    break;
                }
                Err(_) => {
                    self.failed = true;
                    break;
                }
            }
        }
        self.write_buffer.drain(..written);
    }

    /// Whether the reactor should currently be listening for write
    /// readiness on this channel, i.e. there's deferred output.
    pub fn wants_write_readiness(&self) -> bool {
        self.has_buffered_write()
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Drops internal buffers once the channel has failed and both
    /// buffers are empty, so a lingering `Client`/`Session` entry
    /// doesn't hold dead memory between the failure and its owner
    /// being reaped.
    pub fn try_free_resources(&mut self) {
        if self.failed {
            self.read_buffer = Vec::new();
            self.write_buffer = Vec::new();
        }
    }
}

impl std::fmt::Debug for BufferedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedChannel")
            .field("fd", &self.raw())
            .field("failed", &self.failed)
            .field("read_buffered", &self.read_buffer.len())
            .field("write_buffered", &self.write_buffer.len())
            .finish()
    }
}

pub fn trace_channel_event(label: &str, fd: RawFd, readable: bool, writable: bool) {
    trace!(fd, readable, writable, "{label}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_channel() -> (BufferedChannel, BufferedChannel) {
        let (r, w) = unistd::pipe().unwrap();
        let r: RawFd = std::os::fd::IntoRawFd::into_raw_fd(r);
        let w: RawFd = std::os::fd::IntoRawFd::into_raw_fd(w);
        nix::fcntl::fcntl(r, nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK)).unwrap();
        nix::fcntl::fcntl(w, nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK)).unwrap();
        (
            BufferedChannel::new(unsafe { Handle::from_raw(r) }, Kind::Pipe),
            BufferedChannel::new(unsafe { Handle::from_raw(w) }, Kind::Pipe),
        )
    }

    #[test]
    fn write_then_read_round_trips() {
        let (mut read_end, mut write_end) = pipe_channel();
        write_end.write(b"hello");
        assert!(!write_end.has_buffered_write());
        let got = read_end.read(1024);
        assert_eq!(got, b"hello");
    }

    #[test]
    fn read_of_closed_pipe_sets_failed() {
        let (mut read_end, write_end) = pipe_channel();
        drop(write_end);
        let got = read_end.read(1024);
        assert!(got.is_empty());
        assert!(read_end.failed());
    }

    #[test]
    fn try_free_resources_is_noop_unless_failed() {
        let (mut read_end, mut write_end) = pipe_channel();
        write_end.write(b"x");
        let _ = read_end.read(1024);
        read_end.try_free_resources();
        assert!(!read_end.failed());
    }
}
