//! Message Store
//!
//! Reference-counted holder of immutable message bodies. Every delivery record
//! and every retained slot holds one reference to a [`StoredMessage`] through
//! its [`StoreId`]; the entry is freed when the last reference is released.
//!
//! Entries are kept in id order, which is also the order they are written to
//! a snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{error, trace};

use crate::protocol::QoS;

/// Broker-wide identifier of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreId(pub u64);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from the message store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No more entries can be allocated
    ResourceExhausted,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ResourceExhausted => write!(f, "message store exhausted"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Immutable message content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Store entry: one message plus bookkeeping
#[derive(Debug)]
pub struct StoredMessage {
    pub id: StoreId,
    pub message: Message,
    /// Client that published the message ("" for broker-generated messages)
    pub source_id: Arc<str>,
    /// Packet id assigned by the publishing client
    pub source_mid: u16,
    /// Packet id assigned by the broker
    pub mid: u16,
    ref_count: u32,
    /// Clients this entry has already been queued for (duplicate suppression)
    dest_ids: Vec<Arc<str>>,
}

impl StoredMessage {
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn topic(&self) -> &Arc<str> {
        &self.message.topic
    }
}

/// Content-addressed, reference-counted message store
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: BTreeMap<StoreId, StoredMessage>,
    last_id: u64,
    /// Maximum number of live entries (0 = unlimited)
    max_entries: usize,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that refuses new entries beyond `max_entries` (0 = unlimited)
    pub fn with_limit(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Self::default()
        }
    }

    /// Store a new message under a fresh id.
    ///
    /// The entry starts with no references; callers acquire what they keep.
    pub fn store(
        &mut self,
        source_id: &str,
        source_mid: u16,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<StoreId, StoreError> {
        if self.max_entries > 0 && self.entries.len() >= self.max_entries {
            error!(
                "Message store full ({} entries), refusing message on '{}'",
                self.entries.len(),
                topic
            );
            return Err(StoreError::ResourceExhausted);
        }
        let next = self
            .last_id
            .checked_add(1)
            .ok_or(StoreError::ResourceExhausted)?;
        self.last_id = next;

        let id = StoreId(next);
        self.link(id, source_id, source_mid, 0, topic, payload, qos, retain);
        Ok(id)
    }

    /// Insert an entry under a known id (snapshot restore)
    #[allow(clippy::too_many_arguments)]
    pub fn restore_entry(
        &mut self,
        id: StoreId,
        source_id: &str,
        source_mid: u16,
        mid: u16,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) {
        if id.0 > self.last_id {
            self.last_id = id.0;
        }
        self.link(id, source_id, source_mid, mid, topic, payload, qos, retain);
    }

    #[allow(clippy::too_many_arguments)]
    fn link(
        &mut self,
        id: StoreId,
        source_id: &str,
        source_mid: u16,
        mid: u16,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) {
        trace!("Storing message {} on '{}' from '{}'", id, topic, source_id);
        self.entries.insert(
            id,
            StoredMessage {
                id,
                message: Message {
                    topic: Arc::from(topic),
                    payload,
                    qos,
                    retain,
                },
                source_id: Arc::from(source_id),
                source_mid,
                mid,
                ref_count: 0,
                dest_ids: Vec::new(),
            },
        );
    }

    pub fn get(&self, id: StoreId) -> Option<&StoredMessage> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: StoreId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Take one reference to an entry
    pub fn acquire(&mut self, id: StoreId) {
        match self.entries.get_mut(&id) {
            Some(entry) => entry.ref_count += 1,
            None => error!("Acquire on unknown store entry {}", id),
        }
    }

    /// Drop one reference; frees the entry at zero.
    ///
    /// Returns true if the entry was freed.
    pub fn release(&mut self, id: StoreId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            error!("Release on unknown store entry {}", id);
            return false;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 {
            self.entries.remove(&id);
            trace!("Freed store entry {}", id);
            true
        } else {
            false
        }
    }

    /// Whether this entry was already queued for `client_id`
    pub fn was_sent_to(&self, id: StoreId, client_id: &str) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| e.dest_ids.iter().any(|d| d.as_ref() == client_id))
    }

    /// Record that this entry was queued for `client_id`
    pub fn mark_sent(&mut self, id: StoreId, client_id: &Arc<str>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.dest_ids.push(client_id.clone());
        }
    }

    /// Drop every entry nobody references. Returns how many were removed.
    pub fn purge_unreferenced(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.ref_count > 0);
        before - self.entries.len()
    }

    /// Iterate entries in id order
    pub fn iter(&self) -> impl Iterator<Item = &StoredMessage> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last id handed out
    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    /// Raise the id counter (restored from a snapshot's config chunk)
    pub fn set_last_id(&mut self, last_id: u64) {
        if last_id > self.last_id {
            self.last_id = last_id;
        }
    }
}
