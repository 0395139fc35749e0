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

//! Spawning a shell (or arbitrary program) behind a pseudo-terminal,
//! and reaping it once it exits.

use std::cell::RefCell;
use std::ffi::CString;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::rc::Rc;

use anyhow::{Context, Result};
use nix::pty::{openpty, Winsize};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{info, instrument};

use crate::channel::{BufferedChannel, Kind};
use crate::handle::Handle;
use monomux_protocol::SpawnOptions;

/// How a spawned process exited, translated from the raw wait status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with this code.
    Code(i32),
    /// Killed by this signal; reported to clients as `-signum`.
    Signal(i32),
}

impl ExitStatus {
    pub fn as_code(self) -> i32 {
        match self {
            ExitStatus::Code(c) => c,
            ExitStatus::Signal(s) => -s,
        }
    }
}

/// A running child process attached to a PTY master fd. Owns the
/// master-fd-backed read/write channel views and the child's pid.
pub struct Process {
    pub pid: Pid,
    /// Shared ownership of the PTY master `Handle` between the two
    /// logical channel views. Replaces the original's non-owning
    /// weak-wrap of one fd by two objects: here the fd genuinely has
    /// two owners and is only closed once both are dropped.
    master: Rc<RefCell<Handle>>,
}

impl Process {
    /// Forks, opens a PTY, and execs `opts.program` in the child with
    /// a fresh session and controlling terminal. Returns the parent's
    /// view of the spawned process; the child never returns (it either
    /// execs or calls `_exit`).
    #[instrument(skip(opts), fields(program = %opts.program))]
    pub fn spawn(opts: &SpawnOptions, size: Winsize) -> Result<Self> {
        let pty = openpty(&size, None).context("openpty")?;
        let master_fd = pty.master.into_raw_fd();
        let slave_fd = pty.slave.into_raw_fd();

        match unsafe { unistd::fork() }.context("fork")? {
            ForkResult::Parent { child } => {
                let _ = unistd::close(slave_fd);
                let master = unsafe { Handle::from_raw(master_fd) };
                info!(pid = child.as_raw(), "spawned child");
                Ok(Process { pid: child, master: Rc::new(RefCell::new(master)) })
            }
            ForkResult::Child => {
                let _ = unistd::close(master_fd);
                if let Err(e) = exec_in_child(slave_fd, opts) {
                    // We're past the point of graceful error recovery:
                    // stdio may already be half-redirected. Bail out
                    // immediately rather than returning into a forked
                    // copy of the parent's control flow.
                    eprintln!("monomux: failed to start {}: {e:?}", opts.program);
                    std::process::exit(127);
                }
                unreachable!("exec_in_child only returns on error");
            }
        }
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.borrow().raw()
    }

    /// Builds the server's read-side view (draining shell output) over
    /// the shared master fd.
    pub fn read_channel(&self) -> BufferedChannel {
        BufferedChannel::new_shared(Rc::clone(&self.master))
    }

    /// Builds the server's write-side view (delivering client input)
    /// over the shared master fd.
    pub fn write_channel(&self) -> BufferedChannel {
        BufferedChannel::new_shared(Rc::clone(&self.master))
    }

    pub fn resize(&self, size: Winsize) -> Result<()> {
        unsafe {
            if libc::ioctl(self.master_fd(), libc::TIOCSWINSZ, &size as *const Winsize) != 0 {
                return Err(std::io::Error::last_os_error()).context("TIOCSWINSZ");
            }
        }
        Ok(())
    }

    /// Delivers `signum` to the entire process group rooted at the
    /// child, not just the child itself -- a shell's job-control
    /// children must see it too.
    pub fn signal(&self, signum: i32) -> Result<()> {
        let pgid = Pid::from_raw(-self.pid.as_raw());
        let sig = nix::sys::signal::Signal::try_from(signum).context("invalid signal number")?;
        nix::sys::signal::kill(pgid, sig).context("kill(pgid)")
    }

    /// Non-blocking reap, intended to be called after a SIGCHLD has
    /// been bridged into the reactor via the self-pipe in
    /// [`crate::signals`]. Returns `None` if the child hasn't exited
    /// yet (spurious wakeup, or another child's SIGCHLD).
    pub fn try_reap(&self) -> Result<Option<ExitStatus>> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Ok(Some(ExitStatus::Code(code))),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(ExitStatus::Signal(sig as i32))),
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(_) => Ok(None),
            Err(nix::errno::Errno::ECHILD) => Ok(Some(ExitStatus::Code(0))),
            Err(e) => Err(e).context("waitpid"),
        }
    }
}

fn exec_in_child(slave_fd: RawFd, opts: &SpawnOptions) -> Result<()> {
    unistd::setsid().context("setsid")?;

    // Safety: TIOCSCTTY makes the slave our controlling terminal; we
    // are the session leader by construction (setsid just above).
    unsafe {
        if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) != 0 {
            return Err(std::io::Error::last_os_error()).context("TIOCSCTTY");
        }
    }

    for fd in [0, 1, 2] {
        unistd::dup2(slave_fd, fd).context("dup2 onto stdio")?;
    }
    if slave_fd > 2 {
        let _ = unistd::close(slave_fd);
    }

    for (key, value) in &opts.env_set {
        std::env::set_var(key, value);
    }
    for key in &opts.env_unset {
        std::env::remove_var(key);
    }

    let program = CString::new(opts.program.as_bytes()).context("program name has a NUL byte")?;
    let mut argv: Vec<CString> = Vec::with_capacity(opts.args.len() + 1);
    argv.push(program.clone());
    for a in &opts.args {
        argv.push(CString::new(a.as_bytes()).context("argument has a NUL byte")?);
    }

    // execvp replaces this process image; on success, this call does
    // not return.
    unistd::execvp(&program, &argv).context("execvp")?;
    unreachable!("execvp only returns on error, which is surfaced above");
}

pub fn pipe_channel_pair() -> Result<(BufferedChannel, BufferedChannel)> {
    let (r, w) = unistd::pipe().context("pipe")?;
    let r_fd = r.as_raw_fd();
    let w_fd = w.as_raw_fd();
    set_nonblocking(r_fd)?;
    set_nonblocking(w_fd)?;
    Ok((
        BufferedChannel::new(unsafe { Handle::from_raw(r.into_raw_fd()) }, Kind::Pipe),
        BufferedChannel::new(unsafe { Handle::from_raw(w.into_raw_fd()) }, Kind::Pipe),
    ))
}

pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).context("fcntl(F_GETFL)")?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).context("fcntl(F_SETFL)")?;
    Ok(())
}
