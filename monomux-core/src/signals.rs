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

//! Bridges `SIGCHLD`/`SIGTERM`/`SIGINT` into the reactor via a
//! self-pipe, instead of a dedicated signal-handling thread. The
//! reactor is single-threaded, so a signal arriving mid-dispatch must
//! not run arbitrary server logic on the signal handler's stack; it
//! just writes a byte to a pipe `signal_hook` already knows how to do
//! async-signal-safely, and the reactor treats that pipe like any
//! other readable fd.
//!
//! The pipe alone only says "some signal fired"; it doesn't say
//! which. `SIGTERM`/`SIGINT` additionally set a `signal_hook::flag`
//! bool the server checks after draining the pipe, the same
//! distinguishing technique the daemon's signal handler uses.

use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::unistd;
use signal_hook::consts::{SIGCHLD, TERM_SIGNALS};
use tracing::trace;

use crate::handle::Handle;
use crate::pty::set_nonblocking;

/// Owns the read end of the self-pipe signals are written to, plus
/// the flag `SIGTERM`/`SIGINT` set; the write end is registered with
/// `signal_hook` and never touched directly again.
pub struct SignalBridge {
    read_end: Handle,
    term: Arc<AtomicBool>,
}

impl SignalBridge {
    /// Registers `SIGCHLD`, `SIGTERM`, and `SIGINT` to write a marker
    /// byte into a fresh pipe, additionally arms a flag on `SIGTERM`/
    /// `SIGINT`, and returns a bridge owning the read end for the
    /// caller to register with the reactor.
    pub fn install() -> Result<Self> {
        let (r, w) = unistd::pipe().context("pipe")?;
        let r_fd: RawFd = r.as_raw_fd();
        set_nonblocking(r_fd)?;
        let w_fd: RawFd = w.as_raw_fd();
        set_nonblocking(w_fd)?;

        for sig in TERM_SIGNALS.iter().copied().chain(std::iter::once(SIGCHLD)) {
            // Safety: `register` only requires the fd stay open and
            // valid for the life of the registration, which it does:
            // `w` is leaked into the signal handler's ownership below.
            unsafe {
                signal_hook::low_level::pipe::register(sig, w_fd)
                    .with_context(|| format!("registering signal {sig}"))?;
            }
        }
        // The write end's lifetime is now the process's lifetime; let
        // the kernel reclaim it on exit rather than tracking an owner
        // for a fd our own code never reads or writes again.
        std::mem::forget(w);

        let term = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            signal_hook::flag::register(*sig, Arc::clone(&term))
                .with_context(|| format!("arming term flag for signal {sig}"))?;
        }

        Ok(SignalBridge { read_end: unsafe { Handle::from_raw(r.into_raw_fd()) }, term })
    }

    pub fn fd(&self) -> RawFd {
        self.read_end.raw()
    }

    /// True once `SIGTERM` or `SIGINT` has fired. Sticky: once set, it
    /// stays set, matching the server shutting down for good on the
    /// first term signal rather than racing a second one.
    pub fn terminate_requested(&self) -> bool {
        self.term.load(Ordering::Relaxed)
    }

    /// Drains and discards any pending marker bytes. Call this once
    /// per readiness notification on [`Self::fd`] -- the byte values
    /// don't distinguish which signal fired, they only tell us that
    /// at least one did, so the caller should follow up by checking
    /// whatever state (e.g. children pending a non-blocking reap, a
    /// termination flag) each handled signal implies.
    pub fn drain(&self) {
        let mut buf = [0u8; 256];
        loop {
            match unistd::read(self.read_end.raw(), &mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => {
                    trace!(n, "drained signal marker bytes");
                    break;
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_does_not_block_on_empty_pipe() {
        let bridge = SignalBridge::install().unwrap();
        bridge.drain();
    }
}
