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

/// Initial capacity of a [`crate::channel::BufferedChannel`]'s
/// read/write back-buffers. They grow as needed past this.
pub const BUF_SIZE: usize = 1024 * 16;

/// Upper bound on a single `read(2)`/`write(2)` syscall's buffer, to
/// keep any one ready fd from starving the rest of the reactor's
/// event batch.
pub const IO_CHUNK_SIZE: usize = 1024 * 4;

pub const STDIN_FD: i32 = 0;
pub const STDOUT_FD: i32 = 1;

/// Default socket file name under the runtime directory, unless
/// overridden with `--socket`.
pub const DEFAULT_SOCKET_NAME: &str = "mnmx.sock";

/// Runtime directory name appended to `$XDG_RUNTIME_DIR` (or
/// `$HOME/.mnmx` if unset).
pub const RUNTIME_DIR_NAME: &str = "mnmx";
