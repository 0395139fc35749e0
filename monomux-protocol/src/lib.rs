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

//! monomux-protocol defines the wire format of the framed control
//! messages the daemon and its clients exchange over a control
//! socket.
//!
//! Every message on the wire is `[size][kind][payload]`. `size` and
//! `kind` are fixed-width little endian integers; the payload is a
//! small, human-auditable bracketed text grammar (think a tiny,
//! ad-hoc XML). The exact grammar is not load-bearing protocol
//! version-to-version -- it only has to be self-delimiting for the
//! known fields of each message kind and round-trip through
//! [`encode_frame`]/[`decode_frame`]. The data channel that carries
//! actual PTY bytes never speaks this format; it is raw bytes end to
//! end.

use std::fmt;

mod grammar;

pub use grammar::GrammarError;

/// The wire tag prefixed to every encoded message so the receiver
/// knows which struct to parse the payload as.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageKind {
    ConnectionNotification = 1,
    ClientIdRequest = 2,
    ClientIdResponse = 3,
    DataSocketRequest = 4,
    DataSocketResponse = 5,
    SessionListRequest = 6,
    SessionListResponse = 7,
    MakeSessionRequest = 8,
    MakeSessionResponse = 9,
    AttachRequest = 10,
    AttachResponse = 11,
    DetachRequest = 12,
    DetachResponse = 13,
    DetachedNotification = 14,
    SignalRequest = 15,
    RedrawNotification = 16,
    StatisticsRequest = 17,
    StatisticsResponse = 18,
}

impl MessageKind {
    pub fn from_u16(n: u16) -> Option<Self> {
        use MessageKind::*;
        Some(match n {
            1 => ConnectionNotification,
            2 => ClientIdRequest,
            3 => ClientIdResponse,
            4 => DataSocketRequest,
            5 => DataSocketResponse,
            6 => SessionListRequest,
            7 => SessionListResponse,
            8 => MakeSessionRequest,
            9 => MakeSessionResponse,
            10 => AttachRequest,
            11 => AttachResponse,
            12 => DetachRequest,
            13 => DetachResponse,
            14 => DetachedNotification,
            15 => SignalRequest,
            16 => RedrawNotification,
            17 => StatisticsRequest,
            18 => StatisticsResponse,
            _ => return None,
        })
    }
}

/// Implemented by every message struct that can cross the control
/// socket. `encode_payload`/`decode_payload` only deal with the
/// bracketed body; the `[size][kind]` prefix is handled once, in
/// [`encode_frame`]/[`decode_frame`].
pub trait WireMessage: Sized {
    const KIND: MessageKind;

    fn encode_payload(&self) -> String;
    fn decode_payload(payload: &str) -> Option<Self>;
}

/// Encodes `msg` as `kind || payload`, with no outer size prefix.
/// The caller (the buffered-channel-backed codec in the core crate)
/// is responsible for prefixing the result with its length.
pub fn encode_frame<T: WireMessage>(msg: &T) -> Vec<u8> {
    let payload = msg.encode_payload();
    let mut buf = Vec::with_capacity(2 + payload.len());
    buf.extend_from_slice(&(T::KIND as u16).to_le_bytes());
    buf.extend_from_slice(payload.as_bytes());
    buf
}

/// Decodes a `kind || payload` buffer (as produced by
/// [`encode_frame`]) as a `T`. Returns `None` if the leading kind tag
/// does not match `T::KIND` or the payload fails to parse.
pub fn decode_frame<T: WireMessage>(buf: &[u8]) -> Option<T> {
    if buf.len() < 2 {
        return None;
    }
    let kind = u16::from_le_bytes([buf[0], buf[1]]);
    if kind != T::KIND as u16 {
        return None;
    }
    let payload = std::str::from_utf8(&buf[2..]).ok()?;
    T::decode_payload(payload)
}

/// Peeks at the kind tag of a `kind || payload` buffer without
/// committing to decoding any particular message type. Used by the
/// dispatcher to pick which `WireMessage` to try.
pub fn peek_kind(buf: &[u8]) -> Option<MessageKind> {
    if buf.len() < 2 {
        return None;
    }
    MessageKind::from_u16(u16::from_le_bytes([buf[0], buf[1]]))
}

/// Identifies a connected client: a stable, server-assigned `id` and
/// a single-use `nonce` the client presents to prove it owns that id
/// when promoting a second connection to be its data channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ClientId {
    pub id: u64,
    pub nonce: u64,
}

impl ClientId {
    fn encode(&self) -> String {
        format!("<CLIENT><ID>{}</ID><NONCE>{}</NONCE></CLIENT>", self.id, self.nonce)
    }

    fn decode(s: &str) -> Option<(Self, &str)> {
        let (body, rest) = grammar::extract(s, "<CLIENT>", "</CLIENT>")?;
        let (id, body) = grammar::extract(body, "<ID>", "</ID>")?;
        let (nonce, _) = grammar::extract(body, "<NONCE>", "</NONCE>")?;
        let id = id.parse().ok()?;
        let nonce = nonce.parse().ok()?;
        Some((ClientId { id, nonce }, rest))
    }
}

/// A view of the spawn-time options for a new session's process,
/// sufficient to transmit over the wire. Environment is always a pair
/// of lists (set, unset), never a map that could carry a null value.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SpawnOptions {
    pub program: String,
    pub args: Vec<String>,
    pub env_set: Vec<(String, String)>,
    pub env_unset: Vec<String>,
}

impl SpawnOptions {
    fn encode(&self) -> String {
        let mut s = String::new();
        s.push_str("<SPAWN><PROGRAM>");
        s.push_str(&self.program);
        s.push_str("</PROGRAM><ARGS>");
        for a in &self.args {
            s.push_str("<ARG>");
            s.push_str(a);
            s.push_str("</ARG>");
        }
        s.push_str("</ARGS><SETENV>");
        for (k, v) in &self.env_set {
            s.push_str("<ENV><KEY>");
            s.push_str(k);
            s.push_str("</KEY><VAL>");
            s.push_str(v);
            s.push_str("</VAL></ENV>");
        }
        s.push_str("</SETENV><UNSETENV>");
        for k in &self.env_unset {
            s.push_str("<VAR>");
            s.push_str(k);
            s.push_str("</VAR>");
        }
        s.push_str("</UNSETENV></SPAWN>");
        s
    }

    fn decode(s: &str) -> Option<(Self, &str)> {
        let (body, rest) = grammar::extract(s, "<SPAWN>", "</SPAWN>")?;
        let (program, body) = grammar::extract(body, "<PROGRAM>", "</PROGRAM>")?;
        let (args_body, body) = grammar::extract(body, "<ARGS>", "</ARGS>")?;
        let args = grammar::extract_all(args_body, "<ARG>", "</ARG>")
            .into_iter()
            .map(str::to_string)
            .collect();
        let (setenv_body, body) = grammar::extract(body, "<SETENV>", "</SETENV>")?;
        let mut env_set = Vec::new();
        for entry in grammar::extract_all(setenv_body, "<ENV>", "</ENV>") {
            let (key, rest) = grammar::extract(entry, "<KEY>", "</KEY>")?;
            let (val, _) = grammar::extract(rest, "<VAL>", "</VAL>")?;
            env_set.push((key.to_string(), val.to_string()));
        }
        let (unsetenv_body, _) = grammar::extract(body, "<UNSETENV>", "</UNSETENV>")?;
        let env_unset = grammar::extract_all(unsetenv_body, "<VAR>", "</VAR>")
            .into_iter()
            .map(str::to_string)
            .collect();
        Some((
            SpawnOptions { program: program.to_string(), args, env_set, env_unset },
            rest,
        ))
    }
}

/// Minimal public information about a session, as transmitted in
/// session listings and attach replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    pub created_at_unix: i64,
}

impl SessionInfo {
    fn encode(&self) -> String {
        format!("<SESSION><NAME>{}</NAME><CREATED>{}</CREATED></SESSION>", self.name, self.created_at_unix)
    }

    fn decode(s: &str) -> Option<(Self, &str)> {
        let (body, rest) = grammar::extract(s, "<SESSION>", "</SESSION>")?;
        let (name, body) = grammar::extract(body, "<NAME>", "</NAME>")?;
        let (created, _) = grammar::extract(body, "<CREATED>", "</CREATED>")?;
        let created_at_unix = created.parse().ok()?;
        Some((SessionInfo { name: name.to_string(), created_at_unix }, rest))
    }
}

/// What a `DetachRequest` should detach.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DetachMode {
    /// Detach the most-recently-active client in the targeted session.
    Latest,
    /// Detach every client attached to the targeted session.
    All,
}

impl fmt::Display for DetachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetachMode::Latest => "Latest",
            DetachMode::All => "All",
        })
    }
}

/// Why a `DetachedNotification` was sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetachedMode {
    /// Gracefully detached upon a `DetachRequest`.
    Detach,
    /// The session's process exited with this code.
    Exit(i32),
    /// The server is shutting down.
    ServerShutdown,
    /// The server forcibly ended the connection because the client
    /// misbehaved.
    Kicked(String),
}

// --- ConnectionNotification --------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionNotification {
    pub accepted: bool,
    pub reason: String,
}

impl WireMessage for ConnectionNotification {
    const KIND: MessageKind = MessageKind::ConnectionNotification;

    fn encode_payload(&self) -> String {
        if self.accepted {
            "<CONNECTION><TRUE /></CONNECTION>".to_string()
        } else {
            format!("<CONNECTION><FALSE /><REASON>{} </REASON></CONNECTION>", self.reason)
        }
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<CONNECTION>", "</CONNECTION>")?;
        if let Some(rest) = body.strip_prefix("<TRUE />") {
            let _ = rest;
            return Some(ConnectionNotification { accepted: true, reason: String::new() });
        }
        let rest = body.strip_prefix("<FALSE />")?;
        let (reason, _) = grammar::extract(rest, "<REASON>", "</REASON>")?;
        let reason = reason.strip_suffix(' ').unwrap_or(reason);
        Some(ConnectionNotification { accepted: false, reason: reason.to_string() })
    }
}

// --- ClientIdRequest / ClientIdResponse ---------------------------

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ClientIdRequest;

impl WireMessage for ClientIdRequest {
    const KIND: MessageKind = MessageKind::ClientIdRequest;

    fn encode_payload(&self) -> String {
        "<CLIENT-ID />".to_string()
    }

    fn decode_payload(s: &str) -> Option<Self> {
        if s == "<CLIENT-ID />" {
            Some(ClientIdRequest)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIdResponse {
    pub client: ClientId,
}

impl WireMessage for ClientIdResponse {
    const KIND: MessageKind = MessageKind::ClientIdResponse;

    fn encode_payload(&self) -> String {
        format!("<CLIENT-ID>{}</CLIENT-ID>", self.client.encode())
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<CLIENT-ID>", "</CLIENT-ID>")?;
        let (client, _) = ClientId::decode(body)?;
        Some(ClientIdResponse { client })
    }
}

// --- DataSocketRequest / DataSocketResponse -----------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSocketRequest {
    pub client: ClientId,
}

impl WireMessage for DataSocketRequest {
    const KIND: MessageKind = MessageKind::DataSocketRequest;

    fn encode_payload(&self) -> String {
        format!("<DATASOCKET>{}</DATASOCKET>", self.client.encode())
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<DATASOCKET>", "</DATASOCKET>")?;
        let (client, _) = ClientId::decode(body)?;
        Some(DataSocketRequest { client })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSocketResponse {
    pub success: bool,
}

impl WireMessage for DataSocketResponse {
    const KIND: MessageKind = MessageKind::DataSocketResponse;

    fn encode_payload(&self) -> String {
        let b = if self.success { "<TRUE />" } else { "<FALSE />" };
        format!("<DATASOCKET>{b}</DATASOCKET>")
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<DATASOCKET>", "</DATASOCKET>")?;
        Some(DataSocketResponse { success: body == "<TRUE />" })
    }
}

// --- SessionListRequest / SessionListResponse ---------------------

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SessionListRequest;

impl WireMessage for SessionListRequest {
    const KIND: MessageKind = MessageKind::SessionListRequest;

    fn encode_payload(&self) -> String {
        "<SESSION-LIST />".to_string()
    }

    fn decode_payload(s: &str) -> Option<Self> {
        if s == "<SESSION-LIST />" {
            Some(SessionListRequest)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

impl WireMessage for SessionListResponse {
    const KIND: MessageKind = MessageKind::SessionListResponse;

    fn encode_payload(&self) -> String {
        let mut s = String::from("<SESSION-LIST>");
        for session in &self.sessions {
            s.push_str(&session.encode());
        }
        s.push_str("</SESSION-LIST>");
        s
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<SESSION-LIST>", "</SESSION-LIST>")?;
        let mut sessions = Vec::new();
        let mut rest = body;
        while !rest.is_empty() {
            let (session, r) = SessionInfo::decode(rest)?;
            sessions.push(session);
            rest = r;
        }
        Some(SessionListResponse { sessions })
    }
}

// --- MakeSessionRequest / MakeSessionResponse ---------------------

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MakeSessionRequest {
    pub name: String,
    pub spawn: SpawnOptions,
}

impl WireMessage for MakeSessionRequest {
    const KIND: MessageKind = MessageKind::MakeSessionRequest;

    fn encode_payload(&self) -> String {
        format!("<MAKE-SESSION><NAME>{}</NAME>{}</MAKE-SESSION>", self.name, self.spawn.encode())
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<MAKE-SESSION>", "</MAKE-SESSION>")?;
        let (name, body) = grammar::extract(body, "<NAME>", "</NAME>")?;
        let (spawn, _) = SpawnOptions::decode(body)?;
        Some(MakeSessionRequest { name: name.to_string(), spawn })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MakeSessionResponse {
    pub success: bool,
    pub actual_name: String,
}

impl WireMessage for MakeSessionResponse {
    const KIND: MessageKind = MessageKind::MakeSessionResponse;

    fn encode_payload(&self) -> String {
        let b = if self.success { "<TRUE />" } else { "<FALSE />" };
        format!("<MAKE-SESSION>{b}<NAME>{}</NAME></MAKE-SESSION>", self.actual_name)
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<MAKE-SESSION>", "</MAKE-SESSION>")?;
        let (success, body) = if let Some(r) = body.strip_prefix("<TRUE />") {
            (true, r)
        } else {
            (false, body.strip_prefix("<FALSE />")?)
        };
        let (name, _) = grammar::extract(body, "<NAME>", "</NAME>")?;
        Some(MakeSessionResponse { success, actual_name: name.to_string() })
    }
}

// --- AttachRequest / AttachResponse --------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AttachRequest {
    pub name: String,
}

impl WireMessage for AttachRequest {
    const KIND: MessageKind = MessageKind::AttachRequest;

    fn encode_payload(&self) -> String {
        format!("<ATTACH><NAME>{}</NAME></ATTACH>", self.name)
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<ATTACH>", "</ATTACH>")?;
        let (name, _) = grammar::extract(body, "<NAME>", "</NAME>")?;
        Some(AttachRequest { name: name.to_string() })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AttachResponse {
    pub success: bool,
    pub session: Option<SessionInfo>,
}

impl WireMessage for AttachResponse {
    const KIND: MessageKind = MessageKind::AttachResponse;

    fn encode_payload(&self) -> String {
        if let Some(session) = &self.session {
            format!("<ATTACH><TRUE />{}</ATTACH>", session.encode())
        } else {
            format!("<ATTACH>{}</ATTACH>", if self.success { "<TRUE />" } else { "<FALSE />" })
        }
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<ATTACH>", "</ATTACH>")?;
        if let Some(rest) = body.strip_prefix("<TRUE />") {
            let (session, _) = SessionInfo::decode(rest)?;
            return Some(AttachResponse { success: true, session: Some(session) });
        }
        body.strip_prefix("<FALSE />")?;
        Some(AttachResponse { success: false, session: None })
    }
}

// --- DetachRequest / DetachResponse / DetachedNotification --------

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DetachRequest {
    pub mode: Option<DetachModeWire>,
    /// The name of the session to target. Required when the issuing
    /// client is not currently attached to any session; ignored (the
    /// client's own session is used) otherwise.
    pub session: Option<String>,
}

/// `DetachMode` restated as a type with a `Default`, so
/// `DetachRequest` can derive one for its test helpers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DetachModeWire(pub DetachMode);

impl Default for DetachModeWire {
    fn default() -> Self {
        DetachModeWire(DetachMode::Latest)
    }
}

impl WireMessage for DetachRequest {
    const KIND: MessageKind = MessageKind::DetachRequest;

    fn encode_payload(&self) -> String {
        let mode = self.mode.unwrap_or_default().0;
        match &self.session {
            Some(name) => format!("<DETACH><MODE>{mode}</MODE><SESSION>{name}</SESSION></DETACH>"),
            None => format!("<DETACH><MODE>{mode}</MODE></DETACH>"),
        }
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<DETACH>", "</DETACH>")?;
        let (mode_str, rest) = grammar::extract(body, "<MODE>", "</MODE>")?;
        let mode = match mode_str {
            "Latest" => DetachMode::Latest,
            "All" => DetachMode::All,
            _ => return None,
        };
        let session = grammar::extract(rest, "<SESSION>", "</SESSION>").map(|(s, _)| s.to_string());
        Some(DetachRequest { mode: Some(DetachModeWire(mode)), session })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DetachResponse;

impl WireMessage for DetachResponse {
    const KIND: MessageKind = MessageKind::DetachResponse;

    fn encode_payload(&self) -> String {
        "<DETACH />".to_string()
    }

    fn decode_payload(s: &str) -> Option<Self> {
        if s == "<DETACH />" {
            Some(DetachResponse)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetachedNotification {
    pub mode: DetachedMode,
}

impl WireMessage for DetachedNotification {
    const KIND: MessageKind = MessageKind::DetachedNotification;

    fn encode_payload(&self) -> String {
        match &self.mode {
            DetachedMode::Detach => "<DETACHED><MODE>Detach</MODE></DETACHED>".to_string(),
            DetachedMode::Exit(code) => {
                format!("<DETACHED><MODE>Exit</MODE><CODE>{code}</CODE></DETACHED>")
            }
            DetachedMode::ServerShutdown => "<DETACHED><MODE>Server</MODE></DETACHED>".to_string(),
            DetachedMode::Kicked(reason) => {
                format!("<DETACHED><MODE>Booted</MODE><REASON>{reason}</REASON></DETACHED>")
            }
        }
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<DETACHED>", "</DETACHED>")?;
        let (mode_str, rest) = grammar::extract(body, "<MODE>", "</MODE>")?;
        let mode = match mode_str {
            "Detach" => DetachedMode::Detach,
            "Server" => DetachedMode::ServerShutdown,
            "Exit" => {
                let (code, _) = grammar::extract(rest, "<CODE>", "</CODE>")?;
                DetachedMode::Exit(code.parse().ok()?)
            }
            "Booted" => {
                let (reason, _) = grammar::extract(rest, "<REASON>", "</REASON>")?;
                DetachedMode::Kicked(reason.to_string())
            }
            _ => return None,
        };
        Some(DetachedNotification { mode })
    }
}

// --- SignalRequest --------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SignalRequest {
    pub signum: i32,
}

impl WireMessage for SignalRequest {
    const KIND: MessageKind = MessageKind::SignalRequest;

    fn encode_payload(&self) -> String {
        format!("<SIGNAL>{}</SIGNAL>", self.signum)
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<SIGNAL>", "</SIGNAL>")?;
        Some(SignalRequest { signum: body.parse().ok()? })
    }
}

// --- RedrawNotification ---------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct RedrawNotification {
    pub rows: u16,
    pub cols: u16,
}

impl WireMessage for RedrawNotification {
    const KIND: MessageKind = MessageKind::RedrawNotification;

    fn encode_payload(&self) -> String {
        format!("<WINDOW-SIZE-CHANGE><ROWS>{}</ROWS><COLS>{}</COLS></WINDOW-SIZE-CHANGE>", self.rows, self.cols)
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let (body, _) = grammar::extract(s, "<WINDOW-SIZE-CHANGE>", "</WINDOW-SIZE-CHANGE>")?;
        let (rows, body) = grammar::extract(body, "<ROWS>", "</ROWS>")?;
        let (cols, _) = grammar::extract(body, "<COLS>", "</COLS>")?;
        Some(RedrawNotification { rows: rows.parse().ok()?, cols: cols.parse().ok()? })
    }
}

// --- StatisticsRequest / StatisticsResponse --------------------------

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct StatisticsRequest;

impl WireMessage for StatisticsRequest {
    const KIND: MessageKind = MessageKind::StatisticsRequest;

    fn encode_payload(&self) -> String {
        "<SEND-STATISTICS />".to_string()
    }

    fn decode_payload(s: &str) -> Option<Self> {
        if s == "<SEND-STATISTICS />" {
            Some(StatisticsRequest)
        } else {
            None
        }
    }
}

/// Not intended for machine consumption: the only contract is that it
/// round-trips through the codec, not that it has any particular
/// internal structure.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct StatisticsResponse {
    pub contents: String,
}

impl WireMessage for StatisticsResponse {
    const KIND: MessageKind = MessageKind::StatisticsResponse;

    fn encode_payload(&self) -> String {
        format!("<STATISTICS Size=\"{}\">{}</STATISTICS>", self.contents.len(), self.contents)
    }

    fn decode_payload(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("<STATISTICS Size=\"")?;
        let quote = rest.find('"')?;
        let size: usize = rest[..quote].parse().ok()?;
        let rest = &rest[quote + 1..];
        let rest = rest.strip_prefix('>')?;
        if rest.len() < size {
            return None;
        }
        let contents = &rest[..size];
        let rest = &rest[size..];
        rest.strip_prefix("</STATISTICS>")?;
        Some(StatisticsResponse { contents: contents.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(buf: &[u8]) -> &str {
        std::str::from_utf8(&buf[2..]).unwrap()
    }

    #[test]
    fn connection_notification_accepted() {
        let msg = ConnectionNotification { accepted: true, reason: String::new() };
        let buf = encode_frame(&msg);
        assert_eq!(payload_of(&buf), "<CONNECTION><TRUE /></CONNECTION>");
        assert_eq!(decode_frame::<ConnectionNotification>(&buf), Some(msg));
    }

    #[test]
    fn connection_notification_rejected() {
        let msg = ConnectionNotification { accepted: false, reason: String::new() };
        let buf = encode_frame(&msg);
        assert_eq!(payload_of(&buf), "<CONNECTION><FALSE /><REASON> </REASON></CONNECTION>");
        assert_eq!(decode_frame::<ConnectionNotification>(&buf).unwrap().reason, "");

        let msg = ConnectionNotification { accepted: false, reason: "Bad intent".to_string() };
        let buf = encode_frame(&msg);
        assert_eq!(
            payload_of(&buf),
            "<CONNECTION><FALSE /><REASON>Bad intent </REASON></CONNECTION>"
        );
        assert_eq!(decode_frame::<ConnectionNotification>(&buf).unwrap().reason, "Bad intent");
    }

    #[test]
    fn client_id_round_trip() {
        assert_eq!(encode_frame(&ClientIdRequest).len(), 2 + "<CLIENT-ID />".len());
        assert_eq!(payload_of(&encode_frame(&ClientIdRequest)), "<CLIENT-ID />");

        let msg = ClientIdResponse { client: ClientId { id: 4, nonce: 2 } };
        let buf = encode_frame(&msg);
        assert_eq!(
            payload_of(&buf),
            "<CLIENT-ID><CLIENT><ID>4</ID><NONCE>2</NONCE></CLIENT></CLIENT-ID>"
        );
        assert_eq!(decode_frame::<ClientIdResponse>(&buf), Some(msg));
    }

    #[test]
    fn data_socket_round_trip() {
        let msg = DataSocketRequest { client: ClientId { id: 2, nonce: 3 } };
        let buf = encode_frame(&msg);
        assert_eq!(
            payload_of(&buf),
            "<DATASOCKET><CLIENT><ID>2</ID><NONCE>3</NONCE></CLIENT></DATASOCKET>"
        );
        assert_eq!(decode_frame::<DataSocketRequest>(&buf), Some(msg));

        let msg = DataSocketResponse { success: true };
        assert_eq!(payload_of(&encode_frame(&msg)), "<DATASOCKET><TRUE /></DATASOCKET>");
        let msg = DataSocketResponse { success: false };
        assert_eq!(payload_of(&encode_frame(&msg)), "<DATASOCKET><FALSE /></DATASOCKET>");
    }

    #[test]
    fn make_session_round_trip() {
        let msg = MakeSessionRequest {
            name: "Foo".to_string(),
            spawn: SpawnOptions {
                program: "/bin/bash".to_string(),
                args: vec!["--norc".to_string(), "--interactive".to_string()],
                env_set: vec![("SHLVL".to_string(), "8".to_string())],
                env_unset: vec!["TERM".to_string()],
            },
        };
        let buf = encode_frame(&msg);
        assert_eq!(decode_frame::<MakeSessionRequest>(&buf), Some(msg));

        let empty = MakeSessionRequest::default();
        let buf = encode_frame(&empty);
        let back = decode_frame::<MakeSessionRequest>(&buf).unwrap();
        assert!(back.name.is_empty());
        assert!(back.spawn.args.is_empty());

        let msg = MakeSessionResponse { success: false, actual_name: "Foo".to_string() };
        assert_eq!(
            payload_of(&encode_frame(&msg)),
            "<MAKE-SESSION><FALSE /><NAME>Foo</NAME></MAKE-SESSION>"
        );
    }

    #[test]
    fn attach_round_trip() {
        let msg = AttachRequest { name: "Foo".to_string() };
        assert_eq!(payload_of(&encode_frame(&msg)), "<ATTACH><NAME>Foo</NAME></ATTACH>");
        assert_eq!(decode_frame::<AttachRequest>(&encode_frame(&msg)), Some(msg));

        let msg = AttachResponse { success: false, session: None };
        assert_eq!(payload_of(&encode_frame(&msg)), "<ATTACH><FALSE /></ATTACH>");

        let msg = AttachResponse {
            success: true,
            session: Some(SessionInfo { name: "Foo".to_string(), created_at_unix: 42 }),
        };
        let buf = encode_frame(&msg);
        assert_eq!(decode_frame::<AttachResponse>(&buf), Some(msg));
    }

    #[test]
    fn detach_round_trip() {
        let msg = DetachRequest { mode: Some(DetachModeWire(DetachMode::Latest)), session: None };
        assert_eq!(payload_of(&encode_frame(&msg)), "<DETACH><MODE>Latest</MODE></DETACH>");
        let msg = DetachRequest { mode: Some(DetachModeWire(DetachMode::All)), session: None };
        assert_eq!(payload_of(&encode_frame(&msg)), "<DETACH><MODE>All</MODE></DETACH>");
        assert_eq!(decode_frame::<DetachRequest>(&encode_frame(&msg)), Some(msg));

        assert_eq!(payload_of(&encode_frame(&DetachResponse)), "<DETACH />");
    }

    #[test]
    fn detached_notification_round_trip() {
        let msg = DetachedNotification { mode: DetachedMode::Detach };
        assert_eq!(payload_of(&encode_frame(&msg)), "<DETACHED><MODE>Detach</MODE></DETACHED>");
        assert_eq!(decode_frame::<DetachedNotification>(&encode_frame(&msg)), Some(msg));

        let msg = DetachedNotification { mode: DetachedMode::Exit(2) };
        assert_eq!(
            payload_of(&encode_frame(&msg)),
            "<DETACHED><MODE>Exit</MODE><CODE>2</CODE></DETACHED>"
        );
        assert_eq!(decode_frame::<DetachedNotification>(&encode_frame(&msg)), Some(msg));

        let msg = DetachedNotification { mode: DetachedMode::ServerShutdown };
        assert_eq!(payload_of(&encode_frame(&msg)), "<DETACHED><MODE>Server</MODE></DETACHED>");

        let msg = DetachedNotification { mode: DetachedMode::Kicked("Test".to_string()) };
        assert_eq!(
            payload_of(&encode_frame(&msg)),
            "<DETACHED><MODE>Booted</MODE><REASON>Test</REASON></DETACHED>"
        );
        assert_eq!(decode_frame::<DetachedNotification>(&encode_frame(&msg)), Some(msg));
    }

    #[test]
    fn signal_round_trip() {
        let msg = SignalRequest { signum: 1 };
        assert_eq!(payload_of(&encode_frame(&msg)), "<SIGNAL>1</SIGNAL>");
        assert_eq!(decode_frame::<SignalRequest>(&encode_frame(&msg)), Some(msg));
    }

    #[test]
    fn redraw_round_trip() {
        let msg = RedrawNotification { rows: 24, cols: 80 };
        assert_eq!(
            payload_of(&encode_frame(&msg)),
            "<WINDOW-SIZE-CHANGE><ROWS>24</ROWS><COLS>80</COLS></WINDOW-SIZE-CHANGE>"
        );
        assert_eq!(decode_frame::<RedrawNotification>(&encode_frame(&msg)), Some(msg));
    }

    #[test]
    fn statistics_round_trip() {
        assert_eq!(payload_of(&encode_frame(&StatisticsRequest)), "<SEND-STATISTICS />");

        let msg = StatisticsResponse { contents: "Foo".to_string() };
        assert_eq!(payload_of(&encode_frame(&msg)), "<STATISTICS Size=\"3\">Foo</STATISTICS>");
        assert_eq!(decode_frame::<StatisticsResponse>(&encode_frame(&msg)), Some(msg));
    }

    #[test]
    fn session_list_round_trip() {
        let msg = SessionListResponse {
            sessions: vec![
                SessionInfo { name: "Foo".to_string(), created_at_unix: 100 },
                SessionInfo { name: "Bar".to_string(), created_at_unix: 200 },
            ],
        };
        let buf = encode_frame(&msg);
        assert_eq!(decode_frame::<SessionListResponse>(&buf), Some(msg));
    }

    #[test]
    fn decode_wrong_kind_is_none() {
        let buf = encode_frame(&ClientIdRequest);
        assert_eq!(decode_frame::<SessionListRequest>(&buf), None);
    }

    #[test]
    fn decode_garbage_payload_is_none() {
        let mut buf = encode_frame(&AttachRequest { name: "x".to_string() });
        buf.truncate(buf.len() - 3);
        assert_eq!(decode_frame::<AttachRequest>(&buf), None);
    }
}
