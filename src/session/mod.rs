//! MQTT Session Management
//!
//! A [`ClientSession`] owns the ordered delivery records of one client. Each
//! record holds a counted reference into the [`MessageStore`] and moves
//! through the QoS acknowledgment state machine until it is retired.
//!
//! Sessions outlive their connection when the client asked for a durable
//! session (clean_session=false); their records are then queued until the
//! client returns.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use tracing::{debug, error, info, trace};

use crate::protocol::{Direction, Outgoing, OutgoingPublish, QoS, Will};
use crate::store::{MessageStore, StoreId};
use crate::transport::{SendError, Transport};


/// Every known session, keyed by client id
pub type Sessions = AHashMap<Arc<str>, ClientSession>;

/// Delivery record state; the discriminants are the persisted codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryState {
    PublishQos0 = 1,
    PublishQos1 = 2,
    WaitForPuback = 3,
    PublishQos2 = 4,
    WaitForPubrec = 5,
    ResendPubrel = 6,
    WaitForPubrel = 7,
    ResendPubcomp = 8,
    WaitForPubcomp = 9,
    SendPubrec = 10,
    Queued = 11,
}

impl DeliveryState {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::PublishQos0,
            2 => Self::PublishQos1,
            3 => Self::WaitForPuback,
            4 => Self::PublishQos2,
            5 => Self::WaitForPubrec,
            6 => Self::ResendPubrel,
            7 => Self::WaitForPubrel,
            8 => Self::ResendPubcomp,
            9 => Self::WaitForPubcomp,
            10 => Self::SendPubrec,
            11 => Self::Queued,
            _ => return None,
        })
    }

    /// State a record enters when it leaves the queue
    pub fn ready(direction: Direction, qos: QoS) -> Self {
        match (direction, qos) {
            (Direction::Out, QoS::AtMostOnce) => Self::PublishQos0,
            (Direction::Out, QoS::AtLeastOnce) => Self::PublishQos1,
            (Direction::Out, QoS::ExactlyOnce) => Self::PublishQos2,
            (Direction::In, _) => Self::SendPubrec,
        }
    }

    /// State to fall back to when the peer did not answer in time
    fn on_timeout(self) -> Option<Self> {
        match self {
            Self::WaitForPuback => Some(Self::PublishQos1),
            Self::WaitForPubrec => Some(Self::PublishQos2),
            Self::WaitForPubrel => Some(Self::SendPubrec),
            Self::WaitForPubcomp => Some(Self::ResendPubrel),
            _ => None,
        }
    }
}

/// Acknowledgment sent by a client for an outbound delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    PubAck,
    PubRec,
    PubComp,
}

impl DeliveryState {
    /// Whether an outbound record in this state can take `ack`.
    ///
    /// Queued records have not been sent, so no ack applies to them.
    fn accepts(self, ack: Ack) -> bool {
        match ack {
            Ack::PubAck => matches!(self, Self::PublishQos1 | Self::WaitForPuback),
            Ack::PubRec => matches!(
                self,
                Self::PublishQos2 | Self::WaitForPubrec | Self::ResendPubrel | Self::WaitForPubcomp
            ),
            Ack::PubComp => matches!(self, Self::ResendPubrel | Self::WaitForPubcomp),
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PublishQos0 => "publish_qos0",
            Self::PublishQos1 => "publish_qos1",
            Self::WaitForPuback => "wait_for_puback",
            Self::PublishQos2 => "publish_qos2",
            Self::WaitForPubrec => "wait_for_pubrec",
            Self::ResendPubrel => "resend_pubrel",
            Self::WaitForPubrel => "wait_for_pubrel",
            Self::ResendPubcomp => "resend_pubcomp",
            Self::WaitForPubcomp => "wait_for_pubcomp",
            Self::SendPubrec => "send_pubrec",
            Self::Queued => "queued",
        };
        f.write_str(name)
    }
}

/// One message on its way to (or from) a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub store_id: StoreId,
    pub mid: u16,
    pub qos: QoS,
    /// Retain flag as delivered (true only for retained replays)
    pub retain: bool,
    pub direction: Direction,
    pub state: DeliveryState,
    /// Last state change, for the retry sweep
    pub timestamp: Instant,
    pub dup: bool,
}

impl DeliveryRecord {
    fn in_flight(&self) -> bool {
        self.qos != QoS::AtMostOnce && self.state != DeliveryState::Queued
    }
}

/// Queue limits and delivery policy shared by every session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLimits {
    /// Maximum QoS 1/2 records in flight per client (0 = unlimited)
    pub max_inflight: usize,
    /// Maximum queued records per client (0 = unlimited)
    pub max_queued: usize,
    /// Deliver an entry again to a client matched by several subscriptions
    pub allow_duplicate_messages: bool,
    /// Queue QoS 0 messages for offline durable sessions
    pub queue_qos0_messages: bool,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_inflight: 20,
            max_queued: 100,
            allow_duplicate_messages: false,
            queue_qos0_messages: false,
        }
    }
}

/// Result of applying a client acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Applied,
    /// No outbound record with that mid
    Unknown,
    /// The record is not waiting for this ack
    Unexpected(DeliveryState),
}

/// Result of offering a message to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Record created, ready for the next write pass
    Ready,
    /// Record created in the queue
    Queued,
    /// Queue full; the new message was dropped
    Dropped,
    /// Entry already delivered to this client
    Duplicate,
    /// Session offline and QoS 0 is not queued
    Offline,
}

impl InsertOutcome {
    /// Whether a record now references the entry
    pub fn accepted(self) -> bool {
        matches!(self, InsertOutcome::Ready | InsertOutcome::Queued)
    }
}

/// Per-client delivery state
#[derive(Debug)]
pub struct ClientSession {
    pub client_id: Arc<str>,
    records: VecDeque<DeliveryRecord>,
    /// QoS 1/2 records not in the queue
    inflight: usize,
    queued: usize,
    last_mid: u16,
    connected: bool,
    clean_session: bool,
    /// Unix time of the last disconnect (0 while never disconnected)
    disconnected_at: i64,
    will: Option<Will>,
    is_dropping: bool,
    dropped: u64,
}

impl ClientSession {
    pub fn new(client_id: Arc<str>, clean_session: bool) -> Self {
        Self {
            client_id,
            records: VecDeque::new(),
            inflight: 0,
            queued: 0,
            last_mid: 0,
            connected: false,
            clean_session,
            disconnected_at: 0,
            will: None,
            is_dropping: false,
            dropped: 0,
        }
    }

    /// Offer a store entry to this session.
    ///
    /// On [`InsertOutcome::Ready`] and [`InsertOutcome::Queued`] the new
    /// record holds its own reference to the entry.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        store: &mut MessageStore,
        limits: &SessionLimits,
        mid: u16,
        direction: Direction,
        qos: QoS,
        retain: bool,
        entry: StoreId,
        now: Instant,
    ) -> InsertOutcome {
        let dedup = !limits.allow_duplicate_messages && direction == Direction::Out && !retain;
        if dedup && store.was_sent_to(entry, &self.client_id) {
            trace!("Entry {} already sent to '{}'", entry, self.client_id);
            return InsertOutcome::Duplicate;
        }

        if !self.connected && qos == QoS::AtMostOnce && !limits.queue_qos0_messages {
            return InsertOutcome::Offline;
        }

        let state = if self.connected && self.has_capacity(limits, qos) && self.queue_is_clear(qos)
        {
            DeliveryState::ready(direction, qos)
        } else if self.queue_has_room(limits) {
            DeliveryState::Queued
        } else {
            self.dropped += 1;
            if !self.is_dropping {
                self.is_dropping = true;
                info!(
                    "Outgoing messages are being dropped for client {}.",
                    self.client_id
                );
            }
            return InsertOutcome::Dropped;
        };
        self.is_dropping = false;

        store.acquire(entry);
        let record = DeliveryRecord {
            store_id: entry,
            mid,
            qos,
            retain,
            direction,
            state,
            timestamp: now,
            dup: false,
        };
        self.count(&record, 1);
        self.records.push_back(record);

        if dedup {
            store.mark_sent(entry, &self.client_id);
        }

        if state == DeliveryState::Queued {
            InsertOutcome::Queued
        } else {
            InsertOutcome::Ready
        }
    }

    fn has_capacity(&self, limits: &SessionLimits, qos: QoS) -> bool {
        qos == QoS::AtMostOnce || limits.max_inflight == 0 || self.inflight < limits.max_inflight
    }

    /// QoS 1/2 messages never overtake queued ones
    fn queue_is_clear(&self, qos: QoS) -> bool {
        qos == QoS::AtMostOnce || self.queued == 0
    }

    fn queue_has_room(&self, limits: &SessionLimits) -> bool {
        limits.max_queued == 0 || self.queued < limits.max_queued
    }

    fn count(&mut self, record: &DeliveryRecord, delta: isize) {
        let apply = |n: usize| n.saturating_add_signed(delta);
        if record.state == DeliveryState::Queued {
            self.queued = apply(self.queued);
        } else if record.in_flight() {
            self.inflight = apply(self.inflight);
        }
    }

    fn position(&self, mid: u16, direction: Direction) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.mid == mid && r.direction == direction)
    }

    fn remove_at(&mut self, index: usize) -> Option<DeliveryRecord> {
        let record = self.records.remove(index)?;
        self.count(&record, -1);
        Some(record)
    }

    /// Retire the record for `mid` (PUBACK / PUBCOMP) and promote queued records.
    ///
    /// Returns false if no such record exists.
    pub fn delete(
        &mut self,
        store: &mut MessageStore,
        limits: &SessionLimits,
        mid: u16,
        direction: Direction,
        now: Instant,
    ) -> bool {
        let Some(record) = self.position(mid, direction).and_then(|i| self.remove_at(i)) else {
            debug!(
                "No {:?} record for mid {} on '{}'",
                direction, mid, self.client_id
            );
            return false;
        };
        store.release(record.store_id);
        self.promote(limits, now);
        true
    }

    /// Move the record for `mid` to a new state (PUBREC received)
    pub fn update(&mut self, mid: u16, direction: Direction, state: DeliveryState, now: Instant) -> bool {
        let Some(record) = self
            .records
            .iter_mut()
            .find(|r| r.mid == mid && r.direction == direction)
        else {
            return false;
        };
        let was_inflight = record.in_flight();
        let was_queued = record.state == DeliveryState::Queued;
        record.state = state;
        record.timestamp = now;
        let (is_inflight, is_queued) = (record.in_flight(), record.state == DeliveryState::Queued);

        if was_queued && !is_queued {
            self.queued -= 1;
        }
        if was_inflight && !is_inflight {
            self.inflight -= 1;
        }
        if !was_inflight && is_inflight {
            self.inflight += 1;
        }
        if !was_queued && is_queued {
            self.queued += 1;
        }
        true
    }

    /// Apply PUBACK, PUBREC or PUBCOMP to the outbound record for `mid`.
    ///
    /// PUBREC moves the record to `resend_pubrel`; the other acks retire it.
    pub fn acknowledge(
        &mut self,
        store: &mut MessageStore,
        limits: &SessionLimits,
        mid: u16,
        ack: Ack,
        now: Instant,
    ) -> AckOutcome {
        let Some(state) = self.position(mid, Direction::Out).map(|i| self.records[i].state) else {
            return AckOutcome::Unknown;
        };
        if !state.accepts(ack) {
            return AckOutcome::Unexpected(state);
        }
        match ack {
            Ack::PubRec => {
                self.update(mid, Direction::Out, DeliveryState::ResendPubrel, now);
            }
            Ack::PubAck | Ack::PubComp => {
                self.delete(store, limits, mid, Direction::Out, now);
            }
        }
        AckOutcome::Applied
    }

    /// Retire an inbound QoS 2 record on PUBREL.
    ///
    /// The record's store reference passes to the caller, who forwards the
    /// entry and then releases it. Returns the entry and the retain flag.
    pub fn release(&mut self, limits: &SessionLimits, mid: u16, now: Instant) -> Option<(StoreId, bool)> {
        let index = self.position(mid, Direction::In)?;
        let record = self.remove_at(index)?;
        self.promote(limits, now);
        Some((record.store_id, record.retain))
    }

    /// Whether an inbound QoS 2 publish with this mid is already held
    pub fn has_inbound(&self, mid: u16) -> bool {
        self.position(mid, Direction::In).is_some()
    }

    /// Promote queued records in FIFO order while capacity allows
    pub fn promote(&mut self, limits: &SessionLimits, now: Instant) {
        if !self.connected {
            return;
        }
        let mut inflight = self.inflight;
        let mut promoted = 0;
        for record in self.records.iter_mut() {
            if record.state != DeliveryState::Queued {
                continue;
            }
            let fits = record.qos == QoS::AtMostOnce
                || limits.max_inflight == 0
                || inflight < limits.max_inflight;
            if !fits {
                break;
            }
            record.state = DeliveryState::ready(record.direction, record.qos);
            record.timestamp = now;
            if record.qos != QoS::AtMostOnce {
                inflight += 1;
            }
            promoted += 1;
        }
        if promoted > 0 {
            self.inflight = inflight;
            self.queued -= promoted;
            trace!("Promoted {} queued records for '{}'", promoted, self.client_id);
        }
    }

    /// Revert records whose acknowledgment is overdue so they are resent
    pub fn timeout_check(&mut self, now: Instant, retry_interval: Duration) {
        for record in self.records.iter_mut() {
            if now.saturating_duration_since(record.timestamp) < retry_interval {
                continue;
            }
            if let Some(state) = record.state.on_timeout() {
                debug!(
                    "Retrying mid {} for '{}' ({} -> {})",
                    record.mid, self.client_id, record.state, state
                );
                record.state = state;
                record.dup = true;
                record.timestamp = now;
            }
        }
    }

    /// Prepare records for a resumed session.
    ///
    /// Outbound records go back to their send state with the duplicate flag,
    /// inbound records below QoS 2 are dropped since the client resends them,
    /// then queued records are promoted.
    pub fn reconnect_reset(&mut self, store: &mut MessageStore, limits: &SessionLimits, now: Instant) {
        let mut kept = VecDeque::with_capacity(self.records.len());
        for mut record in self.records.drain(..) {
            match record.direction {
                Direction::Out => {
                    if record.state != DeliveryState::Queued {
                        record.state = match (record.qos, record.state) {
                            (QoS::ExactlyOnce, DeliveryState::WaitForPubcomp)
                            | (QoS::ExactlyOnce, DeliveryState::ResendPubrel) => {
                                DeliveryState::ResendPubrel
                            }
                            (qos, _) => DeliveryState::ready(Direction::Out, qos),
                        };
                        record.dup = true;
                        record.timestamp = now;
                    }
                    kept.push_back(record);
                }
                Direction::In if record.qos == QoS::ExactlyOnce => kept.push_back(record),
                Direction::In => {
                    store.release(record.store_id);
                }
            }
        }
        self.records = kept;
        self.recount();
        self.promote(limits, now);
    }

    /// Write pass: hand every record that has something to send to the transport.
    ///
    /// Stops at the first transport failure; the failed record keeps its state
    /// and is retried by the next pass.
    pub fn write_messages<T: Transport>(
        &mut self,
        store: &mut MessageStore,
        limits: &SessionLimits,
        transport: &mut T,
        now: Instant,
    ) -> Result<(), SendError> {
        if !self.connected {
            return Ok(());
        }

        let mut index = 0;
        while index < self.records.len() {
            let record = &self.records[index];
            let (packet, next) = match record.state {
                DeliveryState::PublishQos0 => (self.publish_packet(store, record), None),
                DeliveryState::PublishQos1 => (
                    self.publish_packet(store, record),
                    Some(DeliveryState::WaitForPuback),
                ),
                DeliveryState::PublishQos2 => (
                    self.publish_packet(store, record),
                    Some(DeliveryState::WaitForPubrec),
                ),
                DeliveryState::SendPubrec => (
                    Some(Outgoing::PubRec(record.mid)),
                    Some(DeliveryState::WaitForPubrel),
                ),
                DeliveryState::ResendPubrel => (
                    Some(Outgoing::PubRel(record.mid)),
                    Some(DeliveryState::WaitForPubcomp),
                ),
                DeliveryState::ResendPubcomp => (
                    Some(Outgoing::PubComp(record.mid)),
                    Some(DeliveryState::WaitForPubrel),
                ),
                _ => {
                    index += 1;
                    continue;
                }
            };

            let Some(packet) = packet else {
                // Entry vanished from the store; nothing left to deliver
                if let Some(record) = self.remove_at(index) {
                    store.release(record.store_id);
                }
                continue;
            };

            transport.send(&self.client_id, packet)?;

            match next {
                Some(state) => {
                    let record = &mut self.records[index];
                    if matches!(
                        record.state,
                        DeliveryState::PublishQos1 | DeliveryState::PublishQos2
                    ) {
                        record.dup = true;
                    }
                    record.state = state;
                    record.timestamp = now;
                    index += 1;
                }
                None => {
                    if let Some(record) = self.remove_at(index) {
                        store.release(record.store_id);
                    }
                    self.promote(limits, now);
                }
            }
        }
        Ok(())
    }

    fn publish_packet(&self, store: &MessageStore, record: &DeliveryRecord) -> Option<Outgoing> {
        let Some(entry) = store.get(record.store_id) else {
            error!(
                "Record mid {} for '{}' references missing entry {}",
                record.mid, self.client_id, record.store_id
            );
            return None;
        };
        Some(Outgoing::Publish(OutgoingPublish {
            mid: record.mid,
            topic: entry.message.topic.clone(),
            payload: entry.message.payload.clone(),
            qos: record.qos,
            retain: record.retain,
            dup: record.dup,
        }))
    }

    /// Release every record (clean session teardown)
    pub fn clear(&mut self, store: &mut MessageStore) {
        for record in self.records.drain(..) {
            store.release(record.store_id);
        }
        self.inflight = 0;
        self.queued = 0;
    }

    /// Next packet identifier: wraps and never returns 0
    pub fn next_mid(&mut self) -> u16 {
        self.last_mid = self.last_mid.wrapping_add(1);
        if self.last_mid == 0 {
            self.last_mid = 1;
        }
        self.last_mid
    }

    /// Append a record read back from a snapshot, taking a reference
    pub fn push_restored(&mut self, store: &mut MessageStore, record: DeliveryRecord) {
        store.acquire(record.store_id);
        self.count(&record, 1);
        self.records.push_back(record);
    }

    fn recount(&mut self) {
        self.inflight = self.records.iter().filter(|r| r.in_flight()).count();
        self.queued = self
            .records
            .iter()
            .filter(|r| r.state == DeliveryState::Queued)
            .count();
    }

    /// Mark the session connected (or resumed)
    pub fn connect(&mut self, clean_session: bool, will: Option<Will>) {
        self.connected = true;
        self.clean_session = clean_session;
        self.will = will;
        self.is_dropping = false;
    }

    /// Mark the session offline, returning the will message if one was set
    pub fn disconnect(&mut self, unix_time: i64) -> Option<Will> {
        self.connected = false;
        self.disconnected_at = unix_time;
        self.will.take()
    }

    /// Whether a durable offline session has been gone longer than `expiration`
    pub fn is_expired(&self, unix_now: i64, expiration: Duration) -> bool {
        if self.connected || self.clean_session || expiration.is_zero() {
            return false;
        }
        let limit = i64::try_from(expiration.as_secs()).unwrap_or(i64::MAX);
        unix_now.saturating_sub(self.disconnected_at) > limit
    }

    pub fn records(&self) -> impl Iterator<Item = &DeliveryRecord> {
        self.records.iter()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight
    }

    pub fn queued_count(&self) -> usize {
        self.queued
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn last_mid(&self) -> u16 {
        self.last_mid
    }

    pub fn set_last_mid(&mut self, mid: u16) {
        self.last_mid = mid;
    }

    pub fn disconnected_at(&self) -> i64 {
        self.disconnected_at
    }

    pub fn set_disconnected_at(&mut self, unix_time: i64) {
        self.disconnected_at = unix_time;
    }

    pub fn is_dropping(&self) -> bool {
        self.is_dropping
    }

    /// Messages dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
