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

//! A moves-only owning wrapper around a raw file descriptor.

use std::os::fd::RawFd;

use nix::unistd;

/// Owns exactly one raw file descriptor and closes it on drop. There
/// is never more than one `Handle` for a given fd: constructing one
/// from a raw fd is an assertion that ownership has been transferred.
#[derive(Debug)]
pub struct Handle(RawFd);

const INVALID: RawFd = -1;

impl Handle {
    /// Takes ownership of `fd`. The caller must not close `fd` itself
    /// or hand it to another `Handle`.
    ///
    /// # Safety
    /// `fd` must be a valid, open file descriptor not already owned
    /// elsewhere.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Handle(fd)
    }

    pub fn invalid() -> Self {
        Handle(INVALID)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != INVALID
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Releases ownership of the fd without closing it, returning the
    /// raw value. Used when a fd's lifetime is being handed to
    /// another abstraction (e.g. moving a socket fd into a new
    /// `Handle` elsewhere).
    pub fn take(&mut self) -> RawFd {
        std::mem::replace(&mut self.0, INVALID)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.is_valid() {
            // Closing is best-effort: there is nothing useful to do
            // with an error here, and we must not panic in a
            // destructor.
            let _ = unistd::close(self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_handle_is_not_valid() {
        assert!(!Handle::invalid().is_valid());
    }

    #[test]
    fn take_invalidates_the_handle() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let mut h = unsafe { Handle::from_raw(std::os::fd::IntoRawFd::into_raw_fd(r)) };
        let taken = h.take();
        assert!(taken >= 0);
        assert!(!h.is_valid());
        let _ = unistd::close(taken);
        drop(w);
    }
}
