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

//! Frames `monomux_protocol` messages on top of a [`BufferedChannel`]:
//! `[size: usize little endian][kind: u16][payload]`. The protocol
//! crate only knows about `kind || payload`; this module owns the
//! outer length prefix and the sum type used to dispatch an incoming
//! frame to its concrete message type.

use std::mem::size_of;

use monomux_protocol::{
    self as proto, decode_frame, encode_frame, peek_kind, MessageKind, WireMessage,
};

use crate::channel::BufferedChannel;

/// Every control message kind, pre-decoded, for a single `match` at
/// the dispatch site. Replaces a dispatch table keyed by message kind
/// with member-function bindings: here there is one sum type and one
/// `match`.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    ConnectionNotification(proto::ConnectionNotification),
    ClientIdRequest(proto::ClientIdRequest),
    ClientIdResponse(proto::ClientIdResponse),
    DataSocketRequest(proto::DataSocketRequest),
    DataSocketResponse(proto::DataSocketResponse),
    SessionListRequest(proto::SessionListRequest),
    SessionListResponse(proto::SessionListResponse),
    MakeSessionRequest(proto::MakeSessionRequest),
    MakeSessionResponse(proto::MakeSessionResponse),
    AttachRequest(proto::AttachRequest),
    AttachResponse(proto::AttachResponse),
    DetachRequest(proto::DetachRequest),
    DetachResponse(proto::DetachResponse),
    DetachedNotification(proto::DetachedNotification),
    SignalRequest(proto::SignalRequest),
    RedrawNotification(proto::RedrawNotification),
    StatisticsRequest(proto::StatisticsRequest),
    StatisticsResponse(proto::StatisticsResponse),
}

/// Serializes `msg` with its `[size][kind][payload]` frame and queues
/// it for write on `channel`.
pub fn send<T: WireMessage>(channel: &mut BufferedChannel, msg: &T) {
    let body = encode_frame(msg);
    let mut framed = Vec::with_capacity(size_of::<usize>() + body.len());
    framed.extend_from_slice(&body.len().to_le_bytes());
    framed.extend_from_slice(&body);
    channel.write(&framed);
}

/// Attempts to pull one complete frame off `channel`'s buffered reads
/// and dispatch it to a [`ControlMessage`]. Returns `Ok(None)` if a
/// full frame isn't available yet (the partial bytes, if any, are put
/// back so a later call sees them again); the caller should treat
/// that the same as "nothing to do yet", not an error.
pub fn try_recv(channel: &mut BufferedChannel) -> anyhow::Result<Option<ControlMessage>> {
    let buffered = channel.read_all_buffered();
    if buffered.len() < size_of::<usize>() {
        requeue(channel, buffered);
        return Ok(None);
    }

    let mut size_bytes = [0u8; size_of::<usize>()];
    size_bytes.copy_from_slice(&buffered[..size_of::<usize>()]);
    let size = usize::from_le_bytes(size_bytes);

    let header_len = size_of::<usize>();
    if buffered.len() < header_len + size {
        requeue(channel, buffered);
        return Ok(None);
    }

    let body = &buffered[header_len..header_len + size];
    let kind = peek_kind(body).ok_or_else(|| anyhow::anyhow!("unknown message kind tag"))?;
    let msg = decode_kind(kind, body)
        .ok_or_else(|| anyhow::anyhow!("malformed {:?} payload", kind))?;

    let leftover = buffered[header_len + size..].to_vec();
    if !leftover.is_empty() {
        requeue(channel, leftover);
    }
    Ok(Some(msg))
}

fn requeue(channel: &mut BufferedChannel, bytes: Vec<u8>) {
    channel.unread(bytes);
}

fn decode_kind(kind: MessageKind, body: &[u8]) -> Option<ControlMessage> {
    use ControlMessage as C;
    use MessageKind::*;
    Some(match kind {
        ConnectionNotification => C::ConnectionNotification(decode_frame(body)?),
        ClientIdRequest => C::ClientIdRequest(decode_frame(body)?),
        ClientIdResponse => C::ClientIdResponse(decode_frame(body)?),
        DataSocketRequest => C::DataSocketRequest(decode_frame(body)?),
        DataSocketResponse => C::DataSocketResponse(decode_frame(body)?),
        SessionListRequest => C::SessionListRequest(decode_frame(body)?),
        SessionListResponse => C::SessionListResponse(decode_frame(body)?),
        MakeSessionRequest => C::MakeSessionRequest(decode_frame(body)?),
        MakeSessionResponse => C::MakeSessionResponse(decode_frame(body)?),
        AttachRequest => C::AttachRequest(decode_frame(body)?),
        AttachResponse => C::AttachResponse(decode_frame(body)?),
        DetachRequest => C::DetachRequest(decode_frame(body)?),
        DetachResponse => C::DetachResponse(decode_frame(body)?),
        DetachedNotification => C::DetachedNotification(decode_frame(body)?),
        SignalRequest => C::SignalRequest(decode_frame(body)?),
        RedrawNotification => C::RedrawNotification(decode_frame(body)?),
        StatisticsRequest => C::StatisticsRequest(decode_frame(body)?),
        StatisticsResponse => C::StatisticsResponse(decode_frame(body)?),
    })
}
