//! Snapshot persistence.
//!
//! The whole broker state is written as one chunked binary file:
//! - message store entries
//! - durable client sessions with their delivery records
//! - subscriptions of durable clients
//! - retained messages
//!
//! A save encodes everything in memory, writes it next to the live file and
//! renames it into place, so a failed save never damages the last good
//! snapshot. A restore rebuilds fresh components and only hands them over
//! once every chunk has been checked.

pub mod codec;
mod error;
mod models;

pub use error::{PersistenceError, Result};
pub use models::{
    Chunk, Snapshot, StoredClient, StoredClientMessage, StoredConfig, StoredEntry, StoredRetain,
    StoredSubscription,
};

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::session::{ClientSession, DeliveryRecord, Sessions};
use crate::store::{MessageStore, StoreId};
use crate::topic::{is_sys_topic, SubscriptionIndex};

/// Components rebuilt from a snapshot
#[derive(Debug)]
pub struct Restored {
    pub store: MessageStore,
    pub sessions: Sessions,
    pub subscriptions: SubscriptionIndex,
    /// Whether the snapshot was written by an orderly shutdown
    pub shutdown: bool,
    /// Entries dropped because nothing referenced them
    pub purged: usize,
}

/// Build the chunk list for the current broker state.
///
/// Connected sessions have no disconnect time yet and are stamped with
/// `unix_now`, so expiration after a restore counts from the save.
pub fn snapshot(
    store: &MessageStore,
    sessions: &Sessions,
    subscriptions: &SubscriptionIndex,
    shutdown: bool,
    unix_now: i64,
) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(1 + store.len() + subscriptions.retained_count());

    chunks.push(Chunk::Config(StoredConfig {
        shutdown,
        id_size: codec::ID_SIZE,
        last_store_id: store.last_id(),
    }));

    for entry in store.iter() {
        let message = &entry.message;
        chunks.push(Chunk::Entry(StoredEntry {
            store_id: entry.id.0,
            source_id: entry.source_id.to_string(),
            source_mid: entry.source_mid,
            mid: entry.mid,
            topic: message.topic.to_string(),
            qos: message.qos,
            // $SYS values would be stale after a restart
            retain: message.retain && !is_sys_topic(&message.topic),
            payload: message.payload.clone(),
        }));
    }

    let mut durable: Vec<&ClientSession> =
        sessions.values().filter(|s| !s.clean_session()).collect();
    durable.sort_by(|a, b| a.client_id.cmp(&b.client_id));

    for session in durable {
        chunks.push(Chunk::Client(StoredClient {
            client_id: session.client_id.to_string(),
            last_mid: session.last_mid(),
            disconnected_at: if session.is_connected() || session.disconnected_at() == 0 {
                unix_now
            } else {
                session.disconnected_at()
            },
        }));
        for record in session.records() {
            chunks.push(Chunk::ClientMessage(StoredClientMessage {
                client_id: session.client_id.to_string(),
                store_id: record.store_id.0,
                mid: record.mid,
                qos: record.qos,
                retain: record.retain,
                direction: record.direction,
                state: record.state,
                dup: record.dup,
            }));
        }
    }

    for sub in subscriptions.subscriptions() {
        let is_durable = sessions
            .get(&sub.client_id)
            .is_some_and(|s| !s.clean_session());
        if is_durable {
            chunks.push(Chunk::Subscription(StoredSubscription {
                client_id: sub.client_id.to_string(),
                filter: sub.filter,
                qos: sub.qos,
            }));
        }
    }

    for (topic, id) in subscriptions.retained() {
        if !is_sys_topic(&topic) {
            chunks.push(Chunk::Retain(StoredRetain { store_id: id.0 }));
        }
    }

    chunks
}

/// Write a snapshot of the broker state to `path`, replacing it atomically
pub fn save(
    path: &Path,
    store: &MessageStore,
    sessions: &Sessions,
    subscriptions: &SubscriptionIndex,
    shutdown: bool,
    unix_now: i64,
) -> Result<()> {
    let chunks = snapshot(store, sessions, subscriptions, shutdown, unix_now);
    let image = codec::encode(&chunks)?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(&image)?;
    file.as_file().sync_all()?;
    file.persist(path)?;

    info!(
        "Saved snapshot to {} ({} chunks, {} bytes)",
        path.display(),
        chunks.len(),
        image.len()
    );
    Ok(())
}

/// Read and decode a snapshot file. A missing file is `Ok(None)`.
pub fn load(path: &Path) -> Result<Option<Snapshot>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No snapshot at {}", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    codec::decode(Bytes::from(data)).map(Some)
}

/// Rebuild broker components from a decoded snapshot.
///
/// `store` is the empty store to fill (it carries the configured limits).
/// Restored records keep their persisted state and are timestamped `now`.
/// Clients without a disconnect time (version 2 files) count as
/// disconnected at `unix_now`.
pub fn restore(
    snapshot: Snapshot,
    mut store: MessageStore,
    now: Instant,
    unix_now: i64,
) -> Result<Restored> {
    let mut sessions = Sessions::default();
    let mut subscriptions = SubscriptionIndex::new();
    let mut shutdown = false;

    let mut configs = Vec::new();
    let mut entries = Vec::new();
    let mut clients = Vec::new();
    let mut records = Vec::new();
    let mut subs = Vec::new();
    let mut retains = Vec::new();
    for chunk in snapshot.chunks {
        match chunk {
            Chunk::Config(c) => configs.push(c),
            Chunk::Entry(e) => entries.push(e),
            Chunk::Client(c) => clients.push(c),
            Chunk::ClientMessage(m) => records.push(m),
            Chunk::Subscription(s) => subs.push(s),
            Chunk::Retain(r) => retains.push(r),
            Chunk::Unknown { chunk_type, length } => {
                warn!(
                    "Skipping unknown snapshot chunk type {} ({} bytes)",
                    chunk_type, length
                );
            }
        }
    }

    for config in configs {
        shutdown = config.shutdown;
        store.set_last_id(config.last_store_id);
    }

    for entry in entries {
        let id = StoreId(entry.store_id);
        if store.contains(id) {
            return Err(PersistenceError::corrupt(format!(
                "duplicate store entry {}",
                id
            )));
        }
        store.restore_entry(
            id,
            &entry.source_id,
            entry.source_mid,
            entry.mid,
            &entry.topic,
            entry.payload,
            entry.qos,
            entry.retain,
        );
    }

    for client in clients {
        let session = durable_session(&mut sessions, &client.client_id);
        session.set_last_mid(client.last_mid);
        session.set_disconnected_at(if client.disconnected_at == 0 {
            unix_now
        } else {
            client.disconnected_at
        });
    }

    for record in records {
        let id = StoreId(record.store_id);
        if !store.contains(id) {
            return Err(PersistenceError::corrupt(format!(
                "client message for '{}' references missing store entry {}",
                record.client_id, id
            )));
        }
        let session = durable_session(&mut sessions, &record.client_id);
        session.push_restored(
            &mut store,
            DeliveryRecord {
                store_id: id,
                mid: record.mid,
                qos: record.qos,
                retain: record.retain,
                direction: record.direction,
                state: record.state,
                timestamp: now,
                dup: record.dup,
            },
        );
    }

    for sub in subs {
        let session = durable_session(&mut sessions, &sub.client_id);
        let client_id = session.client_id.clone();
        subscriptions.add(&client_id, &sub.filter, sub.qos);
    }

    for retain in retains {
        let id = StoreId(retain.store_id);
        let Some(topic) = store.get(id).map(|e| e.topic().clone()) else {
            return Err(PersistenceError::corrupt(format!(
                "retained message references missing store entry {}",
                id
            )));
        };
        subscriptions.set_retained(&mut store, &topic, id);
    }

    let purged = store.purge_unreferenced();
    info!(
        "Restored {} store entries, {} sessions, {} subscriptions, {} retained ({} unreferenced purged)",
        store.len(),
        sessions.len(),
        subscriptions.subscription_count(),
        subscriptions.retained_count(),
        purged
    );

    Ok(Restored {
        store,
        sessions,
        subscriptions,
        shutdown,
        purged,
    })
}

fn durable_session<'a>(sessions: &'a mut Sessions, client_id: &str) -> &'a mut ClientSession {
    sessions
        .entry(Arc::from(client_id))
        .or_insert_with_key(|id| ClientSession::new(id.clone(), false))
}
