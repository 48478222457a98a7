//! Frame codec
//!
//! Wire format:
//! `[4 bytes event id, LE u32][4 bytes body length, LE u32][body]`
//!
//! Control payloads are MessagePack maps. A payload-less event has a zero
//! length body. User payloads are copied verbatim in both directions.

use crate::error::{ProtocolError, TransportError};
use crate::protocol::events::{EventType, Message};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the id + length header
pub const HEADER_LEN: usize = 8;

/// Largest body a receiver accepts. User data for a single guild can be
/// sizeable, anything beyond this is a corrupted stream.
pub const MAX_FRAME_BODY: usize = 16 * 1024 * 1024;

/// Build a frame from an id and a pre-encoded body
pub fn encode_frame(event_id: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&event_id.to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Serialize a payload with MessagePack (named fields)
pub fn encode_payload<T: Serialize>(event_id: u32, data: &T) -> Result<Vec<u8>, ProtocolError> {
    rmp_serde::to_vec_named(data).map_err(|source| ProtocolError::Encode {
        event: event_id,
        source,
    })
}

fn decode_payload<T: DeserializeOwned>(event_id: u32, body: &[u8]) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(body).map_err(|source| ProtocolError::Decode {
        event: event_id,
        source,
    })
}

/// Encode a message into a complete frame
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let id = msg.event_type().id();
    let body = match msg {
        Message::Identify(d) => encode_payload(id, d)?,
        Message::Identified(d) => encode_payload(id, d)?,
        Message::Shutdown => Vec::new(),
        Message::StartShards(d) => encode_payload(id, d)?,
        Message::StopShard(d) => encode_payload(id, d)?,
        Message::PrepareShardMigration(d) => encode_payload(id, d)?,
        Message::StartShardMigration(d) => encode_payload(id, d)?,
        Message::AllUserDataSent(d) => encode_payload(id, d)?,
        Message::User { payload, .. } => return Ok(encode_frame(id, payload)),
    };

    Ok(encode_frame(id, &body))
}

/// Decode a frame body according to its event id
///
/// User events are not interpreted here; the body is handed on as-is.
pub fn decode_message(event_id: u32, body: Vec<u8>) -> Result<Message, ProtocolError> {
    let msg = match EventType::from_id(event_id)? {
        EventType::Identify => Message::Identify(decode_payload(event_id, &body)?),
        EventType::Identified => Message::Identified(decode_payload(event_id, &body)?),
        EventType::Shutdown => Message::Shutdown,
        EventType::StartShards => Message::StartShards(decode_payload(event_id, &body)?),
        EventType::StopShard => Message::StopShard(decode_payload(event_id, &body)?),
        EventType::PrepareShardMigration => {
            Message::PrepareShardMigration(decode_payload(event_id, &body)?)
        }
        EventType::StartShardMigration => {
            Message::StartShardMigration(decode_payload(event_id, &body)?)
        }
        EventType::AllUserDataSent => Message::AllUserDataSent(decode_payload(event_id, &body)?),
        EventType::User(event_id) => Message::User {
            event_id,
            payload: body,
        },
    };

    Ok(msg)
}

/// Read one raw frame: header, then exactly `length` body bytes
pub async fn read_frame<R>(r: &mut R) -> Result<(u32, Vec<u8>), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header).await?;

    let event_id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    if len > MAX_FRAME_BODY {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_BODY,
        }
        .into());
    }

    let mut body = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut body).await?;
    }

    Ok((event_id, body))
}
