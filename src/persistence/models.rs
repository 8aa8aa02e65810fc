//! Snapshot chunk models.
//!
//! One struct per chunk type, holding the decoded fields exactly as they
//! appear in the file. Store ids are the ids written in the file; restore
//! maps them back onto live store entries.

use std::fmt;

use bytes::Bytes;

use crate::protocol::{Direction, QoS};
use crate::session::DeliveryState;

/// Chunk type codes
pub const CHUNK_CFG: u16 = 0x01;
pub const CHUNK_MSG_STORE: u16 = 0x02;
pub const CHUNK_CLIENT_MSG: u16 = 0x03;
pub const CHUNK_RETAIN: u16 = 0x04;
pub const CHUNK_SUB: u16 = 0x05;
pub const CHUNK_CLIENT: u16 = 0x06;

/// Broker-wide settings (CFG)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConfig {
    /// Written during an orderly shutdown
    pub shutdown: bool,
    /// Size in bytes of store ids in this file
    pub id_size: u8,
    pub last_store_id: u64,
}

/// Message store entry (MSG_STORE)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub store_id: u64,
    pub source_id: String,
    pub source_mid: u16,
    pub mid: u16,
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

/// Delivery record of a durable client (CLIENT_MSG)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredClientMessage {
    pub client_id: String,
    pub store_id: u64,
    pub mid: u16,
    pub qos: QoS,
    pub retain: bool,
    pub direction: Direction,
    pub state: DeliveryState,
    pub dup: bool,
}

/// Retained slot (RETAIN); the topic is the referenced entry's topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredRetain {
    pub store_id: u64,
}

/// Subscription of a durable client (SUB)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSubscription {
    pub client_id: String,
    pub filter: String,
    pub qos: QoS,
}

/// Durable client session (CLIENT)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredClient {
    pub client_id: String,
    pub last_mid: u16,
    /// Unix time of the last disconnect (0 in version 2 files)
    pub disconnected_at: i64,
}

/// One decoded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Config(StoredConfig),
    Entry(StoredEntry),
    ClientMessage(StoredClientMessage),
    Retain(StoredRetain),
    Subscription(StoredSubscription),
    Client(StoredClient),
    /// Chunk type this build does not know; skipped on restore
    Unknown { chunk_type: u16, length: u32 },
}

impl Chunk {
    pub fn chunk_type(&self) -> u16 {
        match self {
            Chunk::Config(_) => CHUNK_CFG,
            Chunk::Entry(_) => CHUNK_MSG_STORE,
            Chunk::ClientMessage(_) => CHUNK_CLIENT_MSG,
            Chunk::Retain(_) => CHUNK_RETAIN,
            Chunk::Subscription(_) => CHUNK_SUB,
            Chunk::Client(_) => CHUNK_CLIENT,
            Chunk::Unknown { chunk_type, .. } => *chunk_type,
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Config(c) => write!(
                f,
                "DB_CHUNK_CFG: shutdown={} id_size={} last_db_id={}",
                c.shutdown, c.id_size, c.last_store_id
            ),
            Chunk::Entry(e) => write!(
                f,
                "DB_CHUNK_MSG_STORE: id={} source_id='{}' source_mid={} mid={} topic='{}' qos={} retain={} payload_len={}",
                e.store_id,
                e.source_id,
                e.source_mid,
                e.mid,
                e.topic,
                e.qos as u8,
                e.retain as u8,
                e.payload.len()
            ),
            Chunk::ClientMessage(m) => write!(
                f,
                "DB_CHUNK_CLIENT_MSG: client_id='{}' store_id={} mid={} qos={} retain={} direction={} state={} dup={}",
                m.client_id,
                m.store_id,
                m.mid,
                m.qos as u8,
                m.retain as u8,
                m.direction as u8,
                m.state,
                m.dup as u8
            ),
            Chunk::Retain(r) => write!(f, "DB_CHUNK_RETAIN: store_id={}", r.store_id),
            Chunk::Subscription(s) => write!(
                f,
                "DB_CHUNK_SUB: client_id='{}' topic='{}' qos={}",
                s.client_id, s.filter, s.qos as u8
            ),
            Chunk::Client(c) => write!(
                f,
                "DB_CHUNK_CLIENT: client_id='{}' last_mid={} disconnect_t={}",
                c.client_id, c.last_mid, c.disconnected_at
            ),
            Chunk::Unknown { chunk_type, length } => {
                write!(f, "unknown chunk type {} ({} bytes)", chunk_type, length)
            }
        }
    }
}

/// Every chunk of a snapshot file, in file order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub version: u32,
    pub chunks: Vec<Chunk>,
}
