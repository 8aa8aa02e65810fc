//! Broker Core
//!
//! The [`Broker`] value owns every component of the delivery engine: the
//! message store, the subscription index and the client sessions. The event
//! loop feeds it decoded client events and polls it for timed work; all
//! outbound packets go through the [`Transport`] passed into each call.

mod connect;
mod error;
mod publish;
mod qos;
mod subscribe;


pub use error::{BrokerError, Result};

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, PersistenceConfig};
use crate::persistence;
use crate::protocol::{Direction, Event, Outgoing, QoS};
use crate::session::{ClientSession, InsertOutcome, SessionLimits, Sessions};
use crate::store::{MessageStore, StoreId};
use crate::topic::{is_sys_topic, SubscriptionIndex};
use crate::transport::{SendError, Transport};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Per-session queue limits and delivery policy
    pub limits: SessionLimits,
    /// Time before an unacknowledged message is resent
    pub retry_interval: Duration,
    /// Largest accepted payload in bytes (0 = unlimited)
    pub message_size_limit: usize,
    /// Maximum live store entries (0 = unlimited)
    pub max_stored_messages: usize,
    /// Deliver at the subscription QoS instead of the lower of the two
    pub upgrade_outgoing_qos: bool,
    /// Remove durable sessions offline for longer than this (0 = never)
    pub persistent_client_expiration: Duration,
    /// Snapshot persistence
    pub persistence: PersistenceConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            limits: SessionLimits::default(),
            retry_interval: Duration::from_secs(20),
            message_size_limit: 0,
            max_stored_messages: 0,
            upgrade_outgoing_qos: false,
            persistent_client_expiration: Duration::ZERO,
            persistence: PersistenceConfig::default(),
        }
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        Self {
            limits: SessionLimits {
                max_inflight: config.limits.max_inflight,
                max_queued: config.limits.max_queued,
                allow_duplicate_messages: config.mqtt.allow_duplicate_messages,
                queue_qos0_messages: config.mqtt.queue_qos0_messages,
            },
            retry_interval: config.limits.retry_interval,
            message_size_limit: config.limits.message_size_limit,
            max_stored_messages: config.limits.max_stored_messages,
            upgrade_outgoing_qos: config.mqtt.upgrade_outgoing_qos,
            persistent_client_expiration: config.session.persistent_client_expiration,
            persistence: config.persistence.clone(),
        }
    }
}

/// Point-in-time broker counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub clients_connected: usize,
    pub sessions: usize,
    pub stored_messages: usize,
    pub retained_messages: usize,
    pub subscriptions: usize,
    pub inflight_messages: usize,
    pub queued_messages: usize,
    /// Messages dropped because a client queue was full
    pub messages_dropped: u64,
    /// Publishes refused for an invalid topic or oversized payload
    pub publishes_rejected: u64,
}

/// The delivery engine
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    store: MessageStore,
    subscriptions: SubscriptionIndex,
    sessions: Sessions,
    messages_dropped: u64,
    publishes_rejected: u64,
    /// Queued messages and retained changes since the last save
    changes: u64,
    last_save: Option<Instant>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let store = MessageStore::with_limit(config.max_stored_messages);
        Self {
            config,
            store,
            subscriptions: SubscriptionIndex::new(),
            sessions: Sessions::default(),
            messages_dropped: 0,
            publishes_rejected: 0,
            changes: 0,
            last_save: None,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn subscriptions(&self) -> &SubscriptionIndex {
        &self.subscriptions
    }

    pub fn session(&self, client_id: &str) -> Option<&ClientSession> {
        self.sessions.get(client_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    /// Apply one decoded client event, then run the write pass.
    ///
    /// Events other than `Connect` must come from a connected session.
    pub fn handle_event<T: Transport>(
        &mut self,
        client_id: &str,
        event: Event,
        transport: &mut T,
        now: Instant,
    ) -> Result<()> {
        trace!("Event from {}: {:?}", client_id, event);

        if !matches!(event, Event::Connect(_)) {
            let connected = self
                .sessions
                .get(client_id)
                .is_some_and(|s| s.is_connected());
            if !connected {
                return Err(BrokerError::ProtocolViolation(format!(
                    "event from unknown or offline client '{}'",
                    client_id
                )));
            }
        }

        let result = match event {
            Event::Connect(connect) => {
                self.handle_connect(client_id, connect, now);
                Ok(())
            }
            Event::Publish(publish) => self.handle_publish(client_id, publish, transport, now),
            Event::PubAck(mid) => {
                self.handle_puback(client_id, mid, now);
                Ok(())
            }
            Event::PubRec(mid) => {
                self.handle_pubrec(client_id, mid, now);
                Ok(())
            }
            Event::PubRel(mid) => {
                self.handle_pubrel(client_id, mid, transport, now);
                Ok(())
            }
            Event::PubComp(mid) => {
                self.handle_pubcomp(client_id, mid, now);
                Ok(())
            }
            Event::Subscribe(subscribe) => {
                self.handle_subscribe(client_id, subscribe, transport, now);
                Ok(())
            }
            Event::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, unsubscribe, transport);
                Ok(())
            }
            Event::Disconnect => self.handle_disconnect(client_id, false, now),
            Event::ConnectionLost => self.handle_disconnect(client_id, true, now),
        };

        // records made ready before a failure still go out
        self.write_all(transport, now);
        result
    }

    /// Timed work: retry sweep, write pass, session expiration and autosave
    pub fn poll<T: Transport>(&mut self, transport: &mut T, now: Instant) -> Result<()> {
        let retry_interval = self.config.retry_interval;
        for session in self.sessions.values_mut().filter(|s| s.is_connected()) {
            session.timeout_check(now, retry_interval);
        }
        self.write_all(transport, now);
        self.expire_sessions(unix_time());
        self.autosave(now)
    }

    /// Run the write pass for every connected session
    fn write_all<T: Transport>(&mut self, transport: &mut T, now: Instant) {
        for session in self.sessions.values_mut().filter(|s| s.is_connected()) {
            match session.write_messages(&mut self.store, &self.config.limits, transport, now) {
                Ok(()) | Err(SendError::WouldBlock) => {}
                Err(SendError::Closed) => {
                    debug!("Write to {} failed: connection closed", session.client_id);
                }
            }
        }
    }

    /// Store a new message and offer it to every matching subscriber
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn publish_message(
        &mut self,
        source_id: &str,
        source_mid: u16,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        now: Instant,
    ) -> Result<()> {
        let id = self
            .store
            .store(source_id, source_mid, topic, payload, qos, retain)?;
        self.store.acquire(id);
        self.messages_queue(id, retain, now);
        self.store.release(id);
        Ok(())
    }

    /// Route a stored entry: update the retained slot and insert a delivery
    /// record for each matching subscription.
    ///
    /// The caller holds a reference to `id` for the duration of the call.
    pub(crate) fn messages_queue(&mut self, id: StoreId, retain: bool, now: Instant) {
        let Some(entry) = self.store.get(id) else {
            error!("Routing unknown store entry {}", id);
            return;
        };
        let topic = entry.topic().clone();
        let msg_qos = entry.message.qos;

        if retain {
            self.subscriptions.set_retained(&mut self.store, &topic, id);
            if !is_sys_topic(&topic) {
                self.changes += 1;
            }
        }

        for subscriber in self.subscriptions.matches(&topic) {
            let Some(session) = self.sessions.get_mut(&subscriber.client_id) else {
                warn!(
                    "Subscription on '{}' for unknown client {}",
                    topic, subscriber.client_id
                );
                continue;
            };
            let qos = if self.config.upgrade_outgoing_qos {
                subscriber.qos
            } else {
                msg_qos.min(subscriber.qos)
            };
            let mid = if qos == QoS::AtMostOnce {
                0
            } else {
                session.next_mid()
            };
            let outcome = session.insert(
                &mut self.store,
                &self.config.limits,
                mid,
                Direction::Out,
                qos,
                false,
                id,
                now,
            );
            match outcome {
                InsertOutcome::Queued => self.changes += 1,
                InsertOutcome::Dropped => self.messages_dropped += 1,
                _ => {}
            }
        }
    }

    /// Remove durable sessions offline for longer than the configured expiration.
    ///
    /// Returns the number of sessions removed.
    pub fn expire_sessions(&mut self, unix_now: i64) -> usize {
        let expiration = self.config.persistent_client_expiration;
        if expiration.is_zero() {
            return 0;
        }
        let expired: Vec<Arc<str>> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(unix_now, expiration))
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in &expired {
            info!("Expiring persistent client {} due to timeout.", client_id);
            self.remove_session(client_id);
        }
        expired.len()
    }

    /// Drop a session with its records and subscriptions
    fn remove_session(&mut self, client_id: &str) {
        if let Some(mut session) = self.sessions.remove(client_id) {
            session.clear(&mut self.store);
        }
        self.subscriptions.remove_client(client_id);
    }

    fn autosave(&mut self, now: Instant) -> Result<()> {
        let persistence = &self.config.persistence;
        if !persistence.enabled {
            return Ok(());
        }
        let last_save = *self.last_save.get_or_insert(now);
        let by_interval = !persistence.autosave_interval.is_zero()
            && now.saturating_duration_since(last_save) >= persistence.autosave_interval;
        let by_changes =
            persistence.autosave_on_changes > 0 && self.changes >= persistence.autosave_on_changes;
        if !(by_interval || by_changes) {
            return Ok(());
        }
        debug!("Autosave ({} changes since last save)", self.changes);
        self.last_save = Some(now);
        self.save(false)
    }

    /// Save a snapshot to the configured path (no-op when persistence is off)
    pub fn save(&mut self, shutdown: bool) -> Result<()> {
        if !self.config.persistence.enabled {
            return Ok(());
        }
        let path = self.config.persistence.path.clone();
        self.save_to(&path, shutdown)
    }

    /// Save a snapshot to `path`
    pub fn save_to(&mut self, path: &Path, shutdown: bool) -> Result<()> {
        if let Err(e) = persistence::save(
            path,
            &self.store,
            &self.sessions,
            &self.subscriptions,
            shutdown,
            unix_time(),
        ) {
            error!("Error saving in-memory database to {}: {}", path.display(), e);
            return Err(e.into());
        }
        self.changes = 0;
        Ok(())
    }

    /// Restore state from the configured snapshot.
    ///
    /// Returns false when persistence is off or no snapshot exists.
    pub fn restore(&mut self, now: Instant) -> Result<bool> {
        if !self.config.persistence.enabled {
            return Ok(false);
        }
        let path = self.config.persistence.path.clone();
        self.restore_from(&path, now)
    }

    /// Restore state from `path`. Current state is only replaced on success.
    pub fn restore_from(&mut self, path: &Path, now: Instant) -> Result<bool> {
        let Some(snapshot) = persistence::load(path)? else {
            info!("No snapshot at {}, starting empty", path.display());
            return Ok(false);
        };
        let version = snapshot.version;
        let store = MessageStore::with_limit(self.config.max_stored_messages);
        let restored = persistence::restore(snapshot, store, now, unix_time())?;

        if !restored.shutdown {
            warn!(
                "Snapshot {} was not written by an orderly shutdown",
                path.display()
            );
        }
        info!(
            "Restored {} (version {}): {} messages, {} sessions, {} subscriptions, {} retained, {} purged",
            path.display(),
            version,
            restored.store.len(),
            restored.sessions.len(),
            restored.subscriptions.subscription_count(),
            restored.subscriptions.retained_count(),
            restored.purged
        );

        self.store = restored.store;
        self.sessions = restored.sessions;
        self.subscriptions = restored.subscriptions;
        self.changes = 0;
        Ok(true)
    }

    /// Final save with the shutdown flag set
    pub fn shutdown(&mut self) -> Result<()> {
        info!("Broker shutting down");
        self.save(true)
    }

    pub fn stats(&self) -> BrokerStats {
        let mut stats = BrokerStats {
            sessions: self.sessions.len(),
            stored_messages: self.store.len(),
            retained_messages: self.subscriptions.retained_count(),
            subscriptions: self.subscriptions.subscription_count(),
            messages_dropped: self.messages_dropped,
            publishes_rejected: self.publishes_rejected,
            ..BrokerStats::default()
        };
        for session in self.sessions.values() {
            if session.is_connected() {
                stats.clients_connected += 1;
            }
            stats.inflight_messages += session.inflight_count();
            stats.queued_messages += session.queued_count();
        }
        stats
    }
}

/// Send a direct reply (acks). Failures are logged; the connection's
/// close event tears the session down.
fn reply<T: Transport>(transport: &mut T, client_id: &str, packet: Outgoing) {
    if let Err(e) = transport.send(client_id, packet) {
        debug!("Reply to {} failed: {}", client_id, e);
    }
}

/// Current wall-clock time in unix seconds
fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
