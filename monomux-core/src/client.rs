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

//! The client side of the protocol: connect, perform the two-socket
//! handshake, then either run synchronous request/response RPCs or
//! hand off to the interactive main loop that shuttles bytes between
//! the terminal and the data socket.

use std::os::fd::RawFd;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::socket::{self, UnixAddr};
use tracing::instrument;

use monomux_protocol as proto;

use crate::channel::{BufferedChannel, Kind};
use crate::codec::{self, ControlMessage};
use crate::consts::{STDIN_FD, STDOUT_FD};
use crate::handle::Handle;
use crate::pty::set_nonblocking;
use crate::reactor::Reactor;

/// The client's view of its own connection: a control channel used
/// for the framed RPCs, and a data channel carrying raw PTY bytes
/// once attached.
pub struct Client {
    control: BufferedChannel,
    data: BufferedChannel,
    reactor: Reactor,
    id: proto::ClientId,
    /// Set for the duration of a synchronous RPC: while true, the
    /// main loop's control-channel dispatch defers to the RPC's own
    /// wait-for-reply loop instead of handling messages itself.
    rpc_in_flight: bool,
}

impl Client {
    /// Connects twice to `socket_path`: once for the control channel,
    /// then again for the data channel, which is promoted via the
    /// nonce the first connection was issued.
    #[instrument(skip(socket_path), fields(socket = %socket_path.as_ref().display()))]
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref();
        let mut control = connect_one(socket_path)?;
        let id = handshake(&mut control)?;

        let mut data = connect_one(socket_path)?;
        let _ = handshake(&mut data)?;
        codec::send(&mut data, &proto::DataSocketRequest { client: id });
        data.flush_writes();
        let response = recv_blocking(&mut data, |msg| match msg {
            ControlMessage::DataSocketResponse(r) => Some(r),
            _ => None,
        })?;
        if !response.success {
            bail!("server rejected data socket promotion");
        }

        let mut reactor = Reactor::new()?;
        reactor.listen(control.raw(), true, false)?;
        reactor.listen(data.raw(), true, false)?;
        reactor.listen(STDIN_FD, true, false)?;

        Ok(Client { control, data, reactor, id, rpc_in_flight: false })
    }

    pub fn id(&self) -> proto::ClientId {
        self.id
    }

    pub fn request_session_list(&mut self) -> Result<Vec<proto::SessionInfo>> {
        let resp = self.rpc(&proto::SessionListRequest, |msg| match msg {
            ControlMessage::SessionListResponse(r) => Some(r),
            _ => None,
        })?;
        Ok(resp.sessions)
    }

    pub fn request_make_session(&mut self, req: proto::MakeSessionRequest) -> Result<proto::MakeSessionResponse> {
        self.rpc(&req, |msg| match msg {
            ControlMessage::MakeSessionResponse(r) => Some(r),
            _ => None,
        })
    }

    pub fn request_attach(&mut self, name: impl Into<String>) -> Result<proto::AttachResponse> {
        self.rpc(&proto::AttachRequest { name: name.into() }, |msg| match msg {
            ControlMessage::AttachResponse(r) => Some(r),
            _ => None,
        })
    }

    pub fn request_detach(&mut self, mode: proto::DetachMode, session: Option<String>) -> Result<()> {
        self.rpc(
            &proto::DetachRequest { mode: Some(proto::DetachModeWire(mode)), session },
            |msg| match msg {
                ControlMessage::DetachResponse(r) => Some(r),
                _ => None,
            },
        )
        .map(|_| ())
    }

    pub fn notify_window_size(&mut self, rows: u16, cols: u16) -> Result<()> {
        codec::send(&mut self.control, &proto::RedrawNotification { rows, cols });
        self.control.flush_writes();
        Ok(())
    }

    pub fn send_signal(&mut self, signum: i32) -> Result<()> {
        codec::send(&mut self.control, &proto::SignalRequest { signum });
        self.control.flush_writes();
        Ok(())
    }

    pub fn send_data(&mut self, bytes: &[u8]) {
        self.data.write(bytes);
    }

    /// A blocking request/response helper used by every synchronous
    /// RPC above. While in flight, the control-response inhibit flag
    /// stops [`Self::main_loop`] from independently dispatching
    /// whatever reply arrives, since this call is already consuming
    /// it.
    fn rpc<Req: proto::WireMessage, Resp>(
        &mut self,
        req: &Req,
        extract: impl Fn(ControlMessage) -> Option<Resp>,
    ) -> Result<Resp> {
        self.rpc_in_flight = true;
        codec::send(&mut self.control, req);
        self.control.flush_writes();
        let result = recv_blocking(&mut self.control, extract);
        self.rpc_in_flight = false;
        result
    }

    /// Runs the interactive loop: copies stdin to the data socket,
    /// the data socket to stdout, and watches the control socket for
    /// out-of-band notifications (mainly `DetachedNotification`).
    /// Returns the exit code the client process should use.
    pub fn main_loop(&mut self) -> Result<i32> {
        loop {
            let events = self.reactor.wait(None)?;
            for event in events {
                if event.fd == STDIN_FD && event.readable {
                    let mut buf = [0u8; crate::consts::IO_CHUNK_SIZE];
                    match nix::unistd::read(STDIN_FD, &mut buf) {
                        Ok(0) => return Ok(0),
                        Ok(n) => self.send_data(&buf[..n]),
                        Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {}
                        Err(e) => return Err(e).context("reading stdin"),
                    }
                } else if event.fd == self.data.raw() {
                    if event.writable {
                        self.data.flush_writes();
                    }
                    if event.readable {
                        let bytes = self.data.read(crate::consts::IO_CHUNK_SIZE);
                        if !bytes.is_empty() {
                            write_stdout(&bytes)?;
                        }
                        if self.data.failed() {
                            return Ok(0);
                        }
                    }
                } else if event.fd == self.control.raw() && event.readable && !self.rpc_in_flight {
                    if let Some(code) = self.drain_control_notifications()? {
                        return Ok(code);
                    }
                }
            }
        }
    }

    fn drain_control_notifications(&mut self) -> Result<Option<i32>> {
        loop {
            match codec::try_recv(&mut self.control)? {
                Some(ControlMessage::DetachedNotification(n)) => {
                    return Ok(Some(match n.mode {
                        proto::DetachedMode::Detach => 0,
                        proto::DetachedMode::Exit(code) => code,
                        proto::DetachedMode::ServerShutdown => 0,
                        proto::DetachedMode::Kicked(_) => 1,
                    }));
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}

fn connect_one(socket_path: &Path) -> Result<BufferedChannel> {
    let fd = socket::socket(
        socket::AddressFamily::Unix,
        socket::SockType::Stream,
        socket::SockFlag::empty(),
        None,
    )
    .context("socket()")?;
    let addr = UnixAddr::new(socket_path).context("building unix address")?;
    socket::connect(std::os::fd::AsRawFd::as_raw_fd(&fd), &addr).context("connect()")?;
    let raw: RawFd = std::os::fd::IntoRawFd::into_raw_fd(fd);
    set_nonblocking(raw)?;
    Ok(BufferedChannel::new(unsafe { Handle::from_raw(raw) }, Kind::DomainSocket))
}

fn handshake(channel: &mut BufferedChannel) -> Result<proto::ClientId> {
    let notif = recv_blocking(channel, |msg| match msg {
        ControlMessage::ConnectionNotification(n) => Some(n),
        _ => None,
    })?;
    if !notif.accepted {
        bail!("server refused connection: {}", notif.reason);
    }
    codec::send(channel, &proto::ClientIdRequest);
    channel.flush_writes();
    let response = recv_blocking(channel, |msg| match msg {
        ControlMessage::ClientIdResponse(r) => Some(r),
        _ => None,
    })?;
    Ok(response.client)
}

/// Spin-polls `channel` for a complete frame, handing it to `extract`
/// until that returns `Some`. A `DetachedNotification` arriving while
/// waiting ends the RPC early, since the server has unilaterally torn
/// down the session the call was about. Used only during the
/// handshake and synchronous RPCs, never in the interactive main
/// loop, which is driven entirely by the reactor.
fn recv_blocking<T>(channel: &mut BufferedChannel, extract: impl Fn(ControlMessage) -> Option<T>) -> Result<T> {
    loop {
        match codec::try_recv(channel) {
            Ok(Some(ControlMessage::DetachedNotification(n))) => {
                bail!("server ended the connection mid-request: {:?}", n.mode);
            }
            Ok(Some(msg)) => {
                if let Some(typed) = extract(msg) {
                    return Ok(typed);
                }
            }
            Ok(None) => {
                if channel.failed() {
                    bail!("control channel closed while waiting for a reply");
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(e),
        }
    }
}

fn write_stdout(bytes: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        match nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(STDOUT_FD) }, &bytes[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("writing stdout"),
        }
    }
    Ok(())
}
