//! Snapshot file codec.
//!
//! Layout:
//!
//! ```text
//! magic[15] | crc u32 BE (0) | version u32 BE | chunk*
//! chunk = type u16 BE | length u32 BE | payload[length]
//! ```
//!
//! Integers are big-endian, except store ids (u64) and the disconnect time
//! (i64) which are little-endian. Strings are a u16 BE length followed by
//! UTF-8 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PersistenceError, Result};
use super::models::*;
use crate::protocol::{Direction, QoS};
use crate::session::DeliveryState;

/// File magic
pub const MAGIC: [u8; 15] = *b"\x00\xb5\x00mosquitto db";

/// Format version written by this build
pub const VERSION: u32 = 3;

/// Oldest version still readable; it lacks the CLIENT disconnect time
pub const MIN_VERSION: u32 = 2;

/// Size of a store id on disk
pub const ID_SIZE: u8 = 8;

const HEADER_LEN: usize = MAGIC.len() + 4 + 4;
const CHUNK_HEADER_LEN: usize = 2 + 4;

/// Encode chunks into a complete snapshot file image
pub fn encode(chunks: &[Chunk]) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + chunks.len() * 32);
    buf.put_slice(&MAGIC);
    buf.put_u32(0);
    buf.put_u32(VERSION);

    let mut body = BytesMut::new();
    for chunk in chunks {
        body.clear();
        encode_body(chunk, &mut body)?;
        let length = u32::try_from(body.len())
            .map_err(|_| PersistenceError::corrupt("chunk exceeds 4 GiB"))?;
        buf.put_u16(chunk.chunk_type());
        buf.put_u32(length);
        buf.put_slice(&body);
    }
    Ok(buf)
}

fn encode_body(chunk: &Chunk, buf: &mut BytesMut) -> Result<()> {
    match chunk {
        Chunk::Config(c) => {
            buf.put_u8(c.shutdown as u8);
            buf.put_u8(ID_SIZE);
            buf.put_u64_le(c.last_store_id);
        }
        Chunk::Entry(e) => {
            buf.put_u64_le(e.store_id);
            put_str(buf, &e.source_id)?;
            buf.put_u16(e.source_mid);
            buf.put_u16(e.mid);
            put_str(buf, &e.topic)?;
            buf.put_u8(e.qos as u8);
            buf.put_u8(e.retain as u8);
            let len = u32::try_from(e.payload.len())
                .map_err(|_| PersistenceError::corrupt("payload exceeds 4 GiB"))?;
            buf.put_u32(len);
            buf.put_slice(&e.payload);
        }
        Chunk::ClientMessage(m) => {
            put_str(buf, &m.client_id)?;
            buf.put_u64_le(m.store_id);
            buf.put_u16(m.mid);
            buf.put_u8(m.qos as u8);
            buf.put_u8(m.retain as u8);
            buf.put_u8(m.direction as u8);
            buf.put_u8(m.state as u8);
            buf.put_u8(m.dup as u8);
        }
        Chunk::Retain(r) => buf.put_u64_le(r.store_id),
        Chunk::Subscription(s) => {
            put_str(buf, &s.client_id)?;
            put_str(buf, &s.filter)?;
            buf.put_u8(s.qos as u8);
        }
        Chunk::Client(c) => {
            put_str(buf, &c.client_id)?;
            buf.put_u16(c.last_mid);
            buf.put_i64_le(c.disconnected_at);
        }
        Chunk::Unknown { chunk_type, .. } => {
            return Err(PersistenceError::corrupt(format!(
                "cannot encode unknown chunk type {}",
                chunk_type
            )));
        }
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| PersistenceError::corrupt(format!("string of {} bytes too long", s.len())))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Decode a complete snapshot file image
pub fn decode(mut data: Bytes) -> Result<Snapshot> {
    if data.len() < MAGIC.len() || data[..MAGIC.len()] != MAGIC {
        return Err(PersistenceError::BadMagic);
    }
    data.advance(MAGIC.len());

    let _crc = take_u32(&mut data)?;
    let version = take_u32(&mut data)?;
    if !(MIN_VERSION..=VERSION).contains(&version) {
        return Err(PersistenceError::UnsupportedVersion(version));
    }

    let mut chunks = Vec::new();
    while data.has_remaining() {
        if data.remaining() < CHUNK_HEADER_LEN {
            return Err(PersistenceError::corrupt("truncated chunk header"));
        }
        let chunk_type = data.get_u16();
        let length = data.get_u32();
        let Ok(len) = usize::try_from(length) else {
            return Err(PersistenceError::corrupt("chunk length overflow"));
        };
        if data.remaining() < len {
            return Err(PersistenceError::corrupt(format!(
                "chunk type {} claims {} bytes, {} left",
                chunk_type,
                len,
                data.remaining()
            )));
        }
        let mut body = data.split_to(len);
        chunks.push(decode_body(chunk_type, length, version, &mut body)?);
    }

    Ok(Snapshot { version, chunks })
}

fn decode_body(chunk_type: u16, length: u32, version: u32, body: &mut Bytes) -> Result<Chunk> {
    let chunk = match chunk_type {
        CHUNK_CFG => {
            let shutdown = take_u8(body)? != 0;
            let id_size = take_u8(body)?;
            if id_size != ID_SIZE {
                return Err(PersistenceError::corrupt(format!(
                    "incompatible configuration (store id size is {} bytes, expected {})",
                    id_size, ID_SIZE
                )));
            }
            Chunk::Config(StoredConfig {
                shutdown,
                id_size,
                last_store_id: take_id(body)?,
            })
        }
        CHUNK_MSG_STORE => {
            let store_id = take_id(body)?;
            let source_id = take_str(body)?;
            let source_mid = take_u16(body)?;
            let mid = take_u16(body)?;
            let topic = take_str(body)?;
            if topic.is_empty() {
                return Err(PersistenceError::corrupt(format!(
                    "message store entry {} has no topic",
                    store_id
                )));
            }
            let qos = take_qos(body)?;
            let retain = take_u8(body)? != 0;
            let payload_len = take_u32(body)? as usize;
            if body.remaining() < payload_len {
                return Err(PersistenceError::corrupt("truncated payload"));
            }
            Chunk::Entry(StoredEntry {
                store_id,
                source_id,
                source_mid,
                mid,
                topic,
                qos,
                retain,
                payload: body.split_to(payload_len),
            })
        }
        CHUNK_CLIENT_MSG => {
            let client_id = take_client_id(body)?;
            let store_id = take_id(body)?;
            let mid = take_u16(body)?;
            let qos = take_qos(body)?;
            let retain = take_u8(body)? != 0;
            let direction = take_u8(body)?;
            let direction = Direction::from_u8(direction).ok_or_else(|| {
                PersistenceError::corrupt(format!("invalid direction {}", direction))
            })?;
            let state = take_u8(body)?;
            let state = DeliveryState::from_u8(state)
                .ok_or_else(|| PersistenceError::corrupt(format!("invalid state {}", state)))?;
            let dup = take_u8(body)? != 0;
            Chunk::ClientMessage(StoredClientMessage {
                client_id,
                store_id,
                mid,
                qos,
                retain,
                direction,
                state,
                dup,
            })
        }
        CHUNK_RETAIN => Chunk::Retain(StoredRetain {
            store_id: take_id(body)?,
        }),
        CHUNK_SUB => Chunk::Subscription(StoredSubscription {
            client_id: take_client_id(body)?,
            filter: take_str(body)?,
            qos: take_qos(body)?,
        }),
        CHUNK_CLIENT => {
            let client_id = take_client_id(body)?;
            let last_mid = take_u16(body)?;
            let disconnected_at = if version >= 3 { take_i64(body)? } else { 0 };
            Chunk::Client(StoredClient {
                client_id,
                last_mid,
                disconnected_at,
            })
        }
        _ => Chunk::Unknown { chunk_type, length },
    };
    Ok(chunk)
}

fn truncated() -> PersistenceError {
    PersistenceError::corrupt("truncated chunk")
}

fn take_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn take_id(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_u64_le())
}

fn take_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_i64_le())
}

fn take_qos(buf: &mut Bytes) -> Result<QoS> {
    let v = take_u8(buf)?;
    QoS::from_u8(v).ok_or_else(|| PersistenceError::corrupt(format!("invalid QoS {}", v)))
}

fn take_str(buf: &mut Bytes) -> Result<String> {
    let len = take_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(PersistenceError::corrupt("truncated string"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| PersistenceError::corrupt("string is not UTF-8"))
}

fn take_client_id(buf: &mut Bytes) -> Result<String> {
    let id = take_str(buf)?;
    if id.is_empty() {
        return Err(PersistenceError::corrupt("empty client id"));
    }
    Ok(id)
}
