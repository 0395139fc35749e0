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

//! The daemon's server state: accepted clients, live sessions, and
//! the attach/detach/promotion protocol that ties the two together.
//!
//! Everything here runs on one thread, driven by one [`Reactor`].
//! There is no lock anywhere in this module: numeric ids plus two
//! owned index maps (`clients` keyed by id, `sessions` keyed by name)
//! replace the raw bidirectional pointers the original implementation
//! used to link a client to its session.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::pty::Winsize;
use nix::sys::socket::{self, UnixAddr};
use rand::RngCore;
use tracing::{info, instrument, warn};

use monomux_protocol as proto;

use crate::channel::{BufferedChannel, Kind};
use crate::codec::{self, ControlMessage};
use crate::handle::Handle;
use crate::pty::{self, ExitStatus, Process};
use crate::reactor::Reactor;
use crate::signals::SignalBridge;

/// A connected client. Exists from the moment its control connection
/// is accepted until its control channel fails.
pub struct Client {
    pub id: u64,
    /// Single-use token handed out in this client's `ClientIdResponse`
    /// and consumed the moment a `DataSocketRequest` presents it back.
    /// Replaced with a fresh value on every promotion attempt -- valid
    /// or not -- so a stale or replayed nonce can never match twice.
    nonce: u64,
    pub control: BufferedChannel,
    pub data: Option<BufferedChannel>,
    pub created_at: Instant,
    pub last_active_at: Instant,
    pub attached_session: Option<String>,
}

impl Client {
    fn touch(&mut self) {
        self.last_active_at = Instant::now();
    }
}

/// A named, persistent shell session. Survives every attached client
/// detaching, until its process exits or it is explicitly killed.
pub struct Session {
    pub name: String,
    pub created_at: Instant,
    pub last_active_at: Instant,
    pub process: Process,
    pub read_channel: BufferedChannel,
    pub write_channel: BufferedChannel,
    /// Clients attached to this session, in attach order. A given
    /// client id appears at most once; the last entry is "latest" for
    /// the purposes of `DetachRequest { mode: Latest }`.
    pub attached_clients: Vec<u64>,
}

impl Session {
    fn info(&self) -> proto::SessionInfo {
        proto::SessionInfo {
            name: self.name.clone(),
            created_at_unix: unix_timestamp(self.created_at),
        }
    }
}

fn unix_timestamp(instant: Instant) -> i64 {
    let since_now = Instant::now().saturating_duration_since(instant);
    chrono::Utc::now().timestamp() - since_now.as_secs() as i64
}

pub struct Server {
    socket_path: PathBuf,
    listener: BufferedChannel,
    reactor: Reactor,
    signals: SignalBridge,
    clients: HashMap<u64, Client>,
    sessions: HashMap<String, Session>,
    /// Secondary index: a promoted client's data-channel fd back to
    /// its client id, so reactor events on that fd can be routed.
    data_fd_index: HashMap<RawFd, u64>,
    next_client_id: u64,
    terminate: bool,
    /// When true, the server shuts down once the last session's
    /// process exits, rather than waiting indefinitely for a new one.
    pub exit_on_last_session_terminate: bool,
    /// Environment variable names stripped from every newly spawned
    /// session's process, on top of whatever the requesting client's
    /// own `SpawnOptions.env_unset` already asked for.
    pub unset_env: Vec<String>,
}

impl Server {
    #[instrument(skip(socket_path), fields(socket = %socket_path.as_ref().display()))]
    pub fn bind(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("creating runtime dir")?;
        }
        let _ = std::fs::remove_file(&socket_path);

        let fd = socket::socket(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            socket::SockFlag::SOCK_NONBLOCK,
            None,
        )
        .context("socket()")?;
        let addr = UnixAddr::new(&socket_path).context("building unix address")?;
        socket::bind(std::os::fd::AsRawFd::as_raw_fd(&fd), &addr).context("bind()")?;
        socket::listen(&fd, socket::Backlog::new(16).unwrap()).context("listen()")?;

        let listener = BufferedChannel::new(
            unsafe { Handle::from_raw(std::os::fd::IntoRawFd::into_raw_fd(fd)) },
            Kind::DomainSocket,
        );

        let mut reactor = Reactor::new()?;
        reactor.listen(listener.raw(), true, false)?;

        let signals = SignalBridge::install()?;
        reactor.listen(signals.fd(), true, false)?;

        Ok(Server {
            socket_path,
            listener,
            reactor,
            signals,
            clients: HashMap::new(),
            sessions: HashMap::new(),
            data_fd_index: HashMap::new(),
            next_client_id: 1,
            terminate: false,
            exit_on_last_session_terminate: false,
            unset_env: Vec::new(),
        })
    }

    pub fn request_shutdown(&mut self) {
        self.terminate = true;
        self.reactor.schedule(self.listener.raw(), false, false);
    }

    /// Runs the server's event loop until it is asked to shut down.
    /// Every `DetachedNotification::ServerShutdown` is sent to all
    /// attached clients before this returns.
    pub fn run(&mut self) -> Result<()> {
        while !self.terminate {
            let events = self.reactor.wait(Some(Duration::from_secs(5)))?;
            for event in events {
                self.dispatch(event.fd, event.readable, event.writable)?;
            }
        }
        self.shutdown();
        Ok(())
    }

    fn dispatch(&mut self, fd: RawFd, readable: bool, writable: bool) -> Result<()> {
        if fd == self.listener.raw() {
            if readable {
                self.accept_loop()?;
            }
            return Ok(());
        }
        if fd == self.signals.fd() {
            self.signals.drain();
            if self.signals.terminate_requested() {
                self.request_shutdown();
                return Ok(());
            }
            self.reap_exited_sessions()?;
            return Ok(());
        }
        if let Some(&client_id) = self.data_fd_index.get(&fd) {
            self.service_data_channel(client_id, readable, writable)?;
            return Ok(());
        }
        if let Some(client_id) = self.find_client_by_control_fd(fd) {
            self.service_control_channel(client_id, readable, writable)?;
            return Ok(());
        }
        if let Some(name) = self.find_session_by_pty_fd(fd) {
            self.service_session_pty(&name)?;
        }
        Ok(())
    }

    fn find_client_by_control_fd(&self, fd: RawFd) -> Option<u64> {
        self.clients.values().find(|c| c.control.raw() == fd).map(|c| c.id)
    }

    fn find_session_by_pty_fd(&self, fd: RawFd) -> Option<String> {
        self.sessions.values().find(|s| s.read_channel.raw() == fd).map(|s| s.name.clone())
    }

    fn accept_loop(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok(Some(handle)) => self.accept_one(handle)?,
                Ok(None) => break,
                Err(nix::errno::Errno::EMFILE) | Err(nix::errno::Errno::ENFILE) => {
                    warn!("fd exhaustion on accept, dropping this connection attempt");
                    break;
                }
                Err(e) => return Err(e).context("accept()"),
            }
        }
        Ok(())
    }

    fn accept_one(&mut self, handle: Handle) -> Result<()> {
        pty::set_nonblocking(handle.raw())?;
        let mut control = BufferedChannel::new(handle, Kind::DomainSocket);
        let id = self.next_client_id;
        self.next_client_id += 1;
        let nonce = rand::thread_rng().next_u64();

        codec::send(&mut control, &proto::ConnectionNotification { accepted: true, reason: String::new() });

        self.reactor.listen(control.raw(), true, true)?;
        let now = Instant::now();
        self.clients.insert(id, Client {
            id,
            nonce,
            control,
            data: None,
            created_at: now,
            last_active_at: now,
            attached_session: None,
        });
        Ok(())
    }

    fn service_control_channel(&mut self, client_id: u64, readable: bool, writable: bool) -> Result<()> {
        let Some(client) = self.clients.get_mut(&client_id) else { return Ok(()) };
        if writable {
            client.control.flush_writes();
        }
        if !readable {
            return Ok(());
        }
        loop {
            let Some(client) = self.clients.get_mut(&client_id) else { return Ok(()) };
            if client.control.failed() {
                self.evict_client(client_id, proto::DetachedMode::Detach)?;
                return Ok(());
            }
            match codec::try_recv(&mut client.control) {
                Ok(Some(msg)) => {
                    client.touch();
                    self.handle_control_message(client_id, msg)?;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(client_id, error = %e, "protocol violation, kicking client");
                    self.kick_client(client_id, "malformed control message")?;
                    break;
                }
            }
        }
        Ok(())
    }

    fn service_data_channel(&mut self, client_id: u64, readable: bool, writable: bool) -> Result<()> {
        let Some(client) = self.clients.get_mut(&client_id) else { return Ok(()) };
        let Some(data) = client.data.as_mut() else { return Ok(()) };
        if writable {
            data.flush_writes();
        }
        if !readable {
            return Ok(());
        }
        let bytes = data.read(crate::consts::IO_CHUNK_SIZE);
        let failed = client.data.as_ref().unwrap().failed();
        if failed {
            self.evict_client(client_id, proto::DetachedMode::Detach)?;
            return Ok(());
        }
        if bytes.is_empty() {
            return Ok(());
        }
        if let Some(session_name) = self.clients.get(&client_id).and_then(|c| c.attached_session.clone()) {
            if let Some(session) = self.sessions.get_mut(&session_name) {
                session.write_channel.write(&bytes);
                session.last_active_at = Instant::now();
            }
        }
        Ok(())
    }

    fn service_session_pty(&mut self, name: &str) -> Result<()> {
        let Some(session) = self.sessions.get_mut(name) else { return Ok(()) };
        let bytes = session.read_channel.read(crate::consts::IO_CHUNK_SIZE);
        let failed = session.read_channel.failed();
        if !bytes.is_empty() {
            session.last_active_at = Instant::now();
            let recipients = session.attached_clients.clone();
            for client_id in recipients {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    if let Some(data) = client.data.as_mut() {
                        data.write(&bytes);
                    }
                }
            }
        }
        if failed {
            // The shell side of the PTY closed before we saw the
            // child exit via SIGCHLD (e.g. it exec'd away its tty).
            // Treat it the same as a confirmed exit with an unknown
            // code, rather than leaving the session to spin forever.
            self.end_session(name, ExitStatus::Code(0))?;
        }
        Ok(())
    }

    fn handle_control_message(&mut self, client_id: u64, msg: ControlMessage) -> Result<()> {
        use ControlMessage as C;
        match msg {
            C::ClientIdRequest(_) => self.reply_client_id(client_id),
            C::DataSocketRequest(req) => self.promote_data_socket(client_id, req),
            C::SessionListRequest(_) => self.reply_session_list(client_id),
            C::MakeSessionRequest(req) => self.make_session(client_id, req),
            C::AttachRequest(req) => self.attach(client_id, req.name),
            C::DetachRequest(req) => self.handle_detach_request(client_id, req),
            C::SignalRequest(req) => self.relay_signal(client_id, req.signum),
            C::RedrawNotification(notif) => self.relay_redraw(client_id, notif),
            C::StatisticsRequest(_) => self.reply_statistics(client_id),
            // These kinds only ever flow server -> client; receiving
            // one from a client is a protocol violation.
            C::ConnectionNotification(_)
            | C::ClientIdResponse(_)
            | C::DataSocketResponse(_)
            | C::SessionListResponse(_)
            | C::MakeSessionResponse(_)
            | C::AttachResponse(_)
            | C::DetachResponse(_)
            | C::DetachedNotification(_)
            | C::StatisticsResponse(_) => self.kick_client(client_id, "unexpected message kind"),
        }
    }

    fn reply_client_id(&mut self, client_id: u64) -> Result<()> {
        let Some(client) = self.clients.get_mut(&client_id) else { return Ok(()) };
        let response = proto::ClientIdResponse { client: proto::ClientId { id: client.id, nonce: client.nonce } };
        codec::send(&mut client.control, &response);
        Ok(())
    }

    /// Handles an incoming `DataSocketRequest`. `client_id` here is the
    /// *ephemeral* connection that just performed its own handshake;
    /// `req.client` names the original client whose data slot is
    /// being filled. On a nonce match, the ephemeral connection's
    /// control channel is moved wholesale into the target client's
    /// data slot and becomes an unframed byte pipe from then on.
    fn promote_data_socket(&mut self, ephemeral_id: u64, req: proto::DataSocketRequest) -> Result<()> {
        let target_id = req.client.id;
        let matches = self
            .clients
            .get(&target_id)
            .map(|c| c.nonce == req.client.nonce)
            .unwrap_or(false);

        if !matches || target_id == ephemeral_id {
            if let Some(ephemeral) = self.clients.get_mut(&ephemeral_id) {
                codec::send(&mut ephemeral.control, &proto::DataSocketResponse { success: false });
            }
            if let Some(target) = self.clients.get_mut(&target_id) {
                target.nonce = rand::thread_rng().next_u64();
            }
            return Ok(());
        }

        let Some(mut ephemeral) = self.clients.remove(&ephemeral_id) else { return Ok(()) };
        self.reactor.stop(ephemeral.control.raw())?;
        codec::send(&mut ephemeral.control, &proto::DataSocketResponse { success: true });
        ephemeral.control.flush_writes();

        let data_fd = ephemeral.control.raw();
        self.reactor.listen(data_fd, true, true)?;
        self.data_fd_index.insert(data_fd, target_id);

        if let Some(target) = self.clients.get_mut(&target_id) {
            target.data = Some(ephemeral.control);
            target.nonce = rand::thread_rng().next_u64();
        }
        Ok(())
    }

    fn reply_session_list(&mut self, client_id: u64) -> Result<()> {
        let sessions = self.sessions.values().map(Session::info).collect();
        if let Some(client) = self.clients.get_mut(&client_id) {
            codec::send(&mut client.control, &proto::SessionListResponse { sessions });
        }
        Ok(())
    }

    fn make_session(&mut self, client_id: u64, req: proto::MakeSessionRequest) -> Result<()> {
        let name = req.name;
        if self.sessions.contains_key(&name) {
            if let Some(client) = self.clients.get_mut(&client_id) {
                codec::send(
                    &mut client.control,
                    &proto::MakeSessionResponse { success: false, actual_name: name },
                );
            }
            return Ok(());
        }

        let size = Winsize { ws_row: 24, ws_col: 80, ws_xpixel: 0, ws_ypixel: 0 };
        let mut spawn = req.spawn;
        for key in &self.unset_env {
            if !spawn.env_unset.contains(key) {
                spawn.env_unset.push(key.clone());
            }
        }
        let process = match Process::spawn(&spawn, size) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to spawn session process");
                if let Some(client) = self.clients.get_mut(&client_id) {
                    codec::send(
                        &mut client.control,
                        &proto::MakeSessionResponse { success: false, actual_name: name },
                    );
                }
                return Ok(());
            }
        };

        let read_channel = process.read_channel();
        let write_channel = process.write_channel();
        self.reactor.listen(read_channel.raw(), true, false)?;

        let now = Instant::now();
        self.sessions.insert(name.clone(), Session {
            name: name.clone(),
            created_at: now,
            last_active_at: now,
            process,
            read_channel,
            write_channel,
            attached_clients: Vec::new(),
        });

        if let Some(client) = self.clients.get_mut(&client_id) {
            codec::send(
                &mut client.control,
                &proto::MakeSessionResponse { success: true, actual_name: name },
            );
        }
        Ok(())
    }

    fn attach(&mut self, client_id: u64, name: String) -> Result<()> {
        if let Some(previous) = self.clients.get(&client_id).and_then(|c| c.attached_session.clone()) {
            // A second Attach from an already-attached client kicks it
            // from the old session rather than attaching it twice.
            self.detach_one(
                client_id,
                &previous,
                proto::DetachedMode::Kicked("attached to a different session".to_string()),
                false,
            )?;
        }

        let Some(session) = self.sessions.get_mut(&name) else {
            if let Some(client) = self.clients.get_mut(&client_id) {
                codec::send(&mut client.control, &proto::AttachResponse { success: false, session: None });
            }
            return Ok(());
        };
        session.attached_clients.retain(|&id| id != client_id);
        session.attached_clients.push(client_id);
        let info = session.info();
        // Push anything the PTY already has buffered through to the
        // newly attached client without waiting for the next kernel
        // readiness notification on the PTY fd.
        self.reactor.schedule(session.read_channel.raw(), true, false);

        if let Some(client) = self.clients.get_mut(&client_id) {
            client.attached_session = Some(name);
            codec::send(&mut client.control, &proto::AttachResponse { success: true, session: Some(info) });
        }
        Ok(())
    }

    fn handle_detach_request(&mut self, client_id: u64, req: proto::DetachRequest) -> Result<()> {
        let session_name = match (&req.session, self.clients.get(&client_id).and_then(|c| c.attached_session.clone())) {
            (Some(named), _) => named.clone(),
            (None, Some(current)) => current,
            (None, None) => {
                // The issuing client is not attached to anything and
                // did not name a target: nothing sensible to do.
                if let Some(client) = self.clients.get_mut(&client_id) {
                    codec::send(&mut client.control, &proto::DetachResponse);
                }
                return Ok(());
            }
        };

        let mode = req.mode.map(|m| m.0).unwrap_or(proto::DetachMode::Latest);
        match mode {
            proto::DetachMode::Latest => {
                if let Some(&latest) = self.sessions.get(&session_name).and_then(|s| s.attached_clients.last()) {
                    self.detach_one(latest, &session_name, proto::DetachedMode::Detach, true)?;
                }
            }
            proto::DetachMode::All => {
                let targets = self
                    .sessions
                    .get(&session_name)
                    .map(|s| s.attached_clients.clone())
                    .unwrap_or_default();
                for target in targets {
                    self.detach_one(target, &session_name, proto::DetachedMode::Detach, true)?;
                }
            }
        }

        if let Some(client) = self.clients.get_mut(&client_id) {
            codec::send(&mut client.control, &proto::DetachResponse);
        }
        Ok(())
    }

    /// Detaches `client_id` from `session_name` and sends it a
    /// `DetachedNotification`. `close_data` tears down the client's
    /// data channel first, so no further PTY output can reach it
    /// after the notification -- set for a real `DetachRequest`, but
    /// not when `attach()` calls this to switch a client from one
    /// session to another, since that client keeps its data channel
    /// for the session it's about to attach to.
    fn detach_one(
        &mut self,
        client_id: u64,
        session_name: &str,
        mode: proto::DetachedMode,
        close_data: bool,
    ) -> Result<()> {
        if let Some(session) = self.sessions.get_mut(session_name) {
            session.attached_clients.retain(|&id| id != client_id);
        }
        if close_data {
            self.close_data_channel(client_id)?;
        }
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.attached_session = None;
            codec::send(&mut client.control, &proto::DetachedNotification { mode });
        }
        Ok(())
    }

    /// Drops a client's data channel, if it has one: stops it in the
    /// reactor and removes it from `data_fd_index`.
    fn close_data_channel(&mut self, client_id: u64) -> Result<()> {
        let Some(client) = self.clients.get_mut(&client_id) else { return Ok(()) };
        if let Some(data) = client.data.take() {
            self.reactor.stop(data.raw())?;
            self.data_fd_index.remove(&data.raw());
        }
        Ok(())
    }

    fn relay_signal(&mut self, client_id: u64, signum: i32) -> Result<()> {
        if let Some(name) = self.clients.get(&client_id).and_then(|c| c.attached_session.clone()) {
            if let Some(session) = self.sessions.get(&name) {
                if let Err(e) = session.process.signal(signum) {
                    warn!(error = %e, "failed to relay signal");
                }
            }
        }
        Ok(())
    }

    fn relay_redraw(&mut self, client_id: u64, notif: proto::RedrawNotification) -> Result<()> {
        let Some(name) = self.clients.get(&client_id).and_then(|c| c.attached_session.clone()) else {
            // Per policy, a redraw from an unattached client is a no-op.
            return Ok(());
        };
        if let Some(session) = self.sessions.get(&name) {
            let size = Winsize { ws_row: notif.rows, ws_col: notif.cols, ws_xpixel: 0, ws_ypixel: 0 };
            if let Err(e) = session.process.resize(size) {
                warn!(error = %e, "failed to propagate window size");
            }
        }
        Ok(())
    }

    fn reply_statistics(&mut self, client_id: u64) -> Result<()> {
        let contents = format!(
            "clients={} sessions={}",
            self.clients.len(),
            self.sessions.len(),
        );
        if let Some(client) = self.clients.get_mut(&client_id) {
            codec::send(&mut client.control, &proto::StatisticsResponse { contents });
        }
        Ok(())
    }

    fn kick_client(&mut self, client_id: u64, reason: &str) -> Result<()> {
        self.evict_client(client_id, proto::DetachedMode::Kicked(reason.to_string()))
    }

    fn evict_client(&mut self, client_id: u64, mode: proto::DetachedMode) -> Result<()> {
        let Some(mut client) = self.clients.remove(&client_id) else { return Ok(()) };
        if !client.control.failed() {
            codec::send(&mut client.control, &proto::DetachedNotification { mode });
            client.control.flush_writes();
        }
        self.reactor.stop(client.control.raw())?;
        if let Some(data) = &client.data {
            self.reactor.stop(data.raw())?;
            self.data_fd_index.remove(&data.raw());
        }
        if let Some(name) = client.attached_session.take() {
            if let Some(session) = self.sessions.get_mut(&name) {
                session.attached_clients.retain(|&id| id != client_id);
            }
        }
        Ok(())
    }

    fn reap_exited_sessions(&mut self) -> Result<()> {
        let names: Vec<String> = self.sessions.keys().cloned().collect();
        for name in names {
            let Some(session) = self.sessions.get(&name) else { continue };
            if let Some(status) = session.process.try_reap()? {
                self.end_session(&name, status)?;
            }
        }
        Ok(())
    }

    fn end_session(&mut self, name: &str, status: ExitStatus) -> Result<()> {
        let Some(session) = self.sessions.remove(name) else { return Ok(()) };
        let _ = self.reactor.stop(session.read_channel.raw());
        for client_id in session.attached_clients {
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.attached_session = None;
                codec::send(
                    &mut client.control,
                    &proto::DetachedNotification { mode: proto::DetachedMode::Exit(status.as_code()) },
                );
                client.control.flush_writes();
            }
        }
        info!(session = name, code = status.as_code(), "session ended");
        if self.exit_on_last_session_terminate && self.sessions.is_empty() {
            self.request_shutdown();
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        for client in self.clients.values_mut() {
            if !client.control.failed() {
                codec::send(
                    &mut client.control,
                    &proto::DetachedNotification { mode: proto::DetachedMode::ServerShutdown },
                );
                client.control.flush_writes();
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
