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

//! monomux-core implements the daemon and client halves of monomux, a
//! mechanism for establishing lightweight persistent terminal
//! sessions that survive network disconnects and controlling-terminal
//! loss. It does not parse command lines; see `monomux-cli` for that.

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod consts;
pub mod handle;
pub mod pty;
pub mod reactor;
pub mod server;
pub mod signals;

pub use client::Client;
pub use server::Server;
