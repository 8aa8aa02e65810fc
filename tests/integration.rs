//! Integration Tests for mqttdb
//!
//! These tests drive the broker through decoded client events and an
//! in-memory transport, checking delivery flows, queue limits, reference
//! counting and snapshot persistence end to end.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use bytes::{BufMut, Bytes, BytesMut};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use mqttdb::broker::{Broker, BrokerConfig, BrokerError};
use mqttdb::persistence::{
    codec, Chunk, PersistenceError, StoredClientMessage, StoredConfig, StoredEntry, StoredRetain,
};
use mqttdb::protocol::{
    Connect, Direction, Event, Outgoing, OutgoingPublish, Publish, QoS, Subscribe,
};
use mqttdb::session::{DeliveryState, SessionLimits};
use mqttdb::store::StoreId;
use mqttdb::transport::MemoryTransport;

/// Test harness: one broker, one transport, a fixed clock
struct TestBroker {
    broker: Broker,
    transport: MemoryTransport,
    now: Instant,
}

impl TestBroker {
    fn new(config: BrokerConfig) -> Self {
        Self {
            broker: Broker::new(config),
            transport: MemoryTransport::new(),
            now: Instant::now(),
        }
    }

    fn send(&mut self, client_id: &str, event: Event) {
        self.broker
            .handle_event(client_id, event, &mut self.transport, self.now)
            .unwrap();
    }

    fn connect(&mut self, client_id: &str, clean_session: bool) {
        self.send(
            client_id,
            Event::Connect(Connect {
                clean_session,
                will: None,
            }),
        );
    }

    fn subscribe(&mut self, client_id: &str, filter: &str, qos: QoS) {
        self.send(client_id, Event::Subscribe(Subscribe::single(1, filter, qos)));
        let acks = self.transport.take(client_id);
        assert!(matches!(acks.first(), Some(Outgoing::SubAck { .. })));
    }

    fn publish(&mut self, client_id: &str, topic: &str, payload: &'static str, qos: QoS, mid: u16) {
        self.send(
            client_id,
            Event::Publish(Publish::new(topic, payload, qos).with_mid(mid)),
        );
    }

    /// Subscribe and return what followed the SUBACK (retained replays)
    fn subscribe_replay(&mut self, client_id: &str, filter: &str, qos: QoS) -> Vec<Outgoing> {
        self.send(client_id, Event::Subscribe(Subscribe::single(1, filter, qos)));
        let mut packets = self.transport.take(client_id);
        assert!(matches!(packets.first(), Some(Outgoing::SubAck { .. })));
        packets.remove(0);
        packets
    }

    fn received(&mut self, client_id: &str) -> Vec<Outgoing> {
        self.transport.take(client_id)
    }

    fn states(&self, client_id: &str) -> Vec<DeliveryState> {
        self.broker
            .session(client_id)
            .map(|s| s.records().map(|r| r.state).collect())
            .unwrap_or_default()
    }
}

fn publish_packet(
    mid: u16,
    topic: &str,
    payload: &'static str,
    qos: QoS,
    retain: bool,
    dup: bool,
) -> Outgoing {
    Outgoing::Publish(OutgoingPublish {
        mid,
        topic: Arc::from(topic),
        payload: Bytes::from_static(payload.as_bytes()),
        qos,
        retain,
        dup,
    })
}

/// Every store entry's reference count equals the records and retained
/// slots pointing at it, and nothing points at a missing entry.
fn assert_refcounts(broker: &Broker) {
    let mut expected: AHashMap<StoreId, u32> = AHashMap::new();
    for session in broker.sessions() {
        for record in session.records() {
            *expected.entry(record.store_id).or_default() += 1;
        }
    }
    for (_, id) in broker.subscriptions().retained() {
        *expected.entry(id).or_default() += 1;
    }

    for entry in broker.store().iter() {
        assert_eq!(
            expected.remove(&entry.id).unwrap_or(0),
            entry.ref_count(),
            "reference count of entry {}",
            entry.id
        );
    }
    assert!(expected.is_empty(), "dangling references: {:?}", expected);
}

// ============================================================================
// Delivery scenarios
// ============================================================================

#[test]
fn test_retained_delivered_to_late_subscriber() {
    let mut t = TestBroker::new(BrokerConfig::default());
    t.connect("pub", true);
    t.send(
        "pub",
        Event::Publish(
            Publish::new("a/b", "hello", QoS::AtLeastOnce)
                .with_mid(1)
                .retained(),
        ),
    );
    assert_eq!(t.received("pub"), vec![Outgoing::PubAck(1)]);

    t.connect("sub", true);
    assert_eq!(
        t.subscribe_replay("sub", "a/b", QoS::AtLeastOnce),
        vec![publish_packet(1, "a/b", "hello", QoS::AtLeastOnce, true, false)]
    );
    assert_refcounts(&t.broker);
}

#[test]
fn test_wildcard_fan_out() {
    let mut t = TestBroker::new(BrokerConfig::default());
    for client in ["s1", "s2"] {
        t.connect(client, true);
        t.subscribe(client, "sensors/#", QoS::AtMostOnce);
    }
    t.connect("pub", true);

    t.publish("pub", "sensors/temp/1", "21.5", QoS::AtMostOnce, 0);
    for client in ["s1", "s2"] {
        assert_eq!(
            t.received(client),
            vec![publish_packet(0, "sensors/temp/1", "21.5", QoS::AtMostOnce, false, false)]
        );
    }

    t.publish("pub", "other/x", "nope", QoS::AtMostOnce, 0);
    assert!(t.received("s1").is_empty());
    assert!(t.received("s2").is_empty());
    assert!(t.broker.store().is_empty());
}

#[test]
fn test_overlapping_subscriptions_deliver_once() {
    let mut t = TestBroker::new(BrokerConfig::default());
    t.connect("sub", true);
    t.subscribe("sub", "a/#", QoS::AtLeastOnce);
    t.subscribe("sub", "a/+", QoS::AtLeastOnce);
    t.connect("pub", true);

    t.publish("pub", "a/b", "x", QoS::AtLeastOnce, 1);
    assert_eq!(t.received("sub").len(), 1);
}

#[test]
fn test_duplicates_allowed_when_configured() {
    let mut t = TestBroker::new(BrokerConfig {
        limits: SessionLimits {
            allow_duplicate_messages: true,
            ..SessionLimits::default()
        },
        ..BrokerConfig::default()
    });
    t.connect("sub", true);
    t.subscribe("sub", "a/#", QoS::AtLeastOnce);
    t.subscribe("sub", "a/+", QoS::AtLeastOnce);
    t.connect("pub", true);

    t.publish("pub", "a/b", "x", QoS::AtLeastOnce, 1);
    assert_eq!(t.received("sub").len(), 2);
    assert_refcounts(&t.broker);
}

#[test]
fn test_sys_topics_hidden_from_root_wildcards() {
    let mut t = TestBroker::new(BrokerConfig::default());
    t.connect("all", true);
    t.subscribe("all", "#", QoS::AtMostOnce);
    t.connect("sys", true);
    t.subscribe("sys", "$SYS/#", QoS::AtMostOnce);
    t.connect("pub", true);

    t.publish("pub", "$SYS/broker/uptime", "10", QoS::AtMostOnce, 0);
    assert!(t.received("all").is_empty());
    assert_eq!(t.received("sys").len(), 1);
}

#[test]
fn test_queued_message_promoted_on_puback() {
    let mut t = TestBroker::new(BrokerConfig {
        limits: SessionLimits {
            max_inflight: 1,
            ..SessionLimits::default()
        },
        ..BrokerConfig::default()
    });
    t.connect("sub", true);
    t.subscribe("sub", "t", QoS::AtLeastOnce);
    t.connect("pub", true);

    t.publish("pub", "t", "first", QoS::AtLeastOnce, 1);
    t.publish("pub", "t", "second", QoS::AtLeastOnce, 2);
    assert_eq!(
        t.received("sub"),
        vec![publish_packet(1, "t", "first", QoS::AtLeastOnce, false, false)]
    );
    assert_eq!(
        t.states("sub"),
        vec![DeliveryState::WaitForPuback, DeliveryState::Queued]
    );

    t.send("sub", Event::PubAck(1));
    assert_eq!(
        t.received("sub"),
        vec![publish_packet(2, "t", "second", QoS::AtLeastOnce, false, false)]
    );
    assert_eq!(t.states("sub"), vec![DeliveryState::WaitForPuback]);
    assert_refcounts(&t.broker);
}

#[test]
fn test_unlimited_inflight() {
    let mut t = TestBroker::new(BrokerConfig {
        limits: SessionLimits {
            max_inflight: 0,
            ..SessionLimits::default()
        },
        ..BrokerConfig::default()
    });
    t.connect("sub", true);
    t.subscribe("sub", "t", QoS::AtLeastOnce);
    t.connect("pub", true);
    for mid in 1..=50 {
        t.publish("pub", "t", "x", QoS::AtLeastOnce, mid);
    }

    assert_eq!(t.received("sub").len(), 50);
    let session = t.broker.session("sub").unwrap();
    assert_eq!(session.inflight_count(), 50);
    assert_eq!(session.queued_count(), 0);
}

#[test]
fn test_qos2_resent_on_reconnect() {
    let mut t = TestBroker::new(BrokerConfig::default());
    t.connect("sub", false);
    t.subscribe("sub", "t", QoS::ExactlyOnce);
    t.connect("pub", true);
    t.publish("pub", "t", "exactly", QoS::ExactlyOnce, 1);
    t.send("pub", Event::PubRel(1));
    t.publish("pub", "t", "exactly2", QoS::ExactlyOnce, 2);
    t.send("pub", Event::PubRel(2));
    assert_eq!(t.received("sub").len(), 2);
    assert_eq!(
        t.states("sub"),
        vec![DeliveryState::WaitForPubrec, DeliveryState::WaitForPubrec]
    );

    t.send("sub", Event::ConnectionLost);
    t.connect("sub", false);
    assert_eq!(
        t.received("sub"),
        vec![
            publish_packet(1, "t", "exactly", QoS::ExactlyOnce, false, true),
            publish_packet(2, "t", "exactly2", QoS::ExactlyOnce, false, true),
        ]
    );
}

#[test]
fn test_full_queue_drops_newest() {
    let mut t = TestBroker::new(BrokerConfig {
        limits: SessionLimits {
            max_queued: 5,
            ..SessionLimits::default()
        },
        ..BrokerConfig::default()
    });
    t.connect("sub", false);
    t.subscribe("sub", "t", QoS::AtLeastOnce);
    t.send("sub", Event::Disconnect);
    t.connect("pub", true);

    for mid in 1..=6 {
        t.publish("pub", "t", "x", QoS::AtLeastOnce, mid);
    }

    let session = t.broker.session("sub").unwrap();
    assert_eq!(session.queued_count(), 5);
    assert_eq!(session.record_count(), 5);
    assert!(session.is_dropping());
    assert_eq!(t.broker.stats().messages_dropped, 1);
    assert_eq!(t.broker.store().len(), 5);

    // The five kept are the five oldest
    t.connect("sub", false);
    let mids: Vec<u16> = t
        .received("sub")
        .into_iter()
        .filter_map(|p| match p {
            Outgoing::Publish(p) => Some(p.mid),
            _ => None,
        })
        .collect();
    assert_eq!(mids, vec![1, 2, 3, 4, 5]);
}

// ============================================================================
// Reference counting
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Connect { client: usize, clean: bool },
    Disconnect { client: usize, lost: bool },
    Subscribe { client: usize, filter: usize, qos: u8 },
    Unsubscribe { client: usize, filter: usize },
    Publish { client: usize, topic: usize, qos: u8, retain: bool, empty: bool, mid: u16 },
    PubAck { client: usize, mid: u16 },
    PubRec { client: usize, mid: u16 },
    PubRel { client: usize, mid: u16 },
    PubComp { client: usize, mid: u16 },
    Poll { secs: u64 },
}

const CLIENTS: [&str; 3] = ["c0", "c1", "c2"];
const TOPICS: [&str; 4] = ["a/b", "a/c", "b", "$SYS/x"];
const FILTERS: [&str; 5] = ["a/b", "a/+", "#", "b", "$SYS/#"];

fn op_strategy() -> impl Strategy<Value = Op> {
    let client = 0..CLIENTS.len();
    let mid = 1u16..6;
    prop_oneof![
        (client.clone(), any::<bool>()).prop_map(|(client, clean)| Op::Connect { client, clean }),
        (client.clone(), any::<bool>()).prop_map(|(client, lost)| Op::Disconnect { client, lost }),
        (client.clone(), 0..FILTERS.len(), 0u8..3)
            .prop_map(|(client, filter, qos)| Op::Subscribe { client, filter, qos }),
        (client.clone(), 0..FILTERS.len())
            .prop_map(|(client, filter)| Op::Unsubscribe { client, filter }),
        (
            client.clone(),
            0..TOPICS.len(),
            0u8..3,
            any::<bool>(),
            prop::bool::weighted(0.1),
            mid.clone()
        )
            .prop_map(|(client, topic, qos, retain, empty, mid)| Op::Publish {
                client,
                topic,
                qos,
                retain,
                empty,
                mid
            }),
        (client.clone(), mid.clone()).prop_map(|(client, mid)| Op::PubAck { client, mid }),
        (client.clone(), mid.clone()).prop_map(|(client, mid)| Op::PubRec { client, mid }),
        (client.clone(), mid.clone()).prop_map(|(client, mid)| Op::PubRel { client, mid }),
        (client, mid).prop_map(|(client, mid)| Op::PubComp { client, mid }),
        (0u64..40).prop_map(|secs| Op::Poll { secs }),
    ]
}

fn qos(v: u8) -> QoS {
    QoS::from_u8(v).unwrap_or_default()
}

proptest! {
    #[test]
    fn prop_refcounts_hold_at_quiescent_points(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let mut broker = Broker::new(BrokerConfig {
            limits: SessionLimits {
                max_inflight: 2,
                max_queued: 3,
                ..SessionLimits::default()
            },
            ..BrokerConfig::default()
        });
        let mut transport = MemoryTransport::new();
        let start = Instant::now();
        let mut now = start;

        for op in ops {
            let (client, event) = match op {
                Op::Connect { client, clean } => (
                    client,
                    Event::Connect(Connect { clean_session: clean, will: None }),
                ),
                Op::Disconnect { client, lost } => (
                    client,
                    if lost { Event::ConnectionLost } else { Event::Disconnect },
                ),
                Op::Subscribe { client, filter, qos: q } => (
                    client,
                    Event::Subscribe(Subscribe::single(1, FILTERS[filter], qos(q))),
                ),
                Op::Unsubscribe { client, filter } => (
                    client,
                    Event::Unsubscribe(mqttdb::protocol::Unsubscribe {
                        mid: 1,
                        filters: vec![FILTERS[filter].to_string()],
                    }),
                ),
                Op::Publish { client, topic, qos: q, retain, empty, mid } => {
                    let payload: &'static str = if empty { "" } else { "payload" };
                    let mut publish = Publish::new(TOPICS[topic], payload, qos(q)).with_mid(mid);
                    publish.retain = retain;
                    (client, Event::Publish(publish))
                }
                Op::PubAck { client, mid } => (client, Event::PubAck(mid)),
                Op::PubRec { client, mid } => (client, Event::PubRec(mid)),
                Op::PubRel { client, mid } => (client, Event::PubRel(mid)),
                Op::PubComp { client, mid } => (client, Event::PubComp(mid)),
                Op::Poll { secs } => {
                    now += std::time::Duration::from_secs(secs);
                    broker.poll(&mut transport, now).unwrap();
                    assert_refcounts(&broker);
                    continue;
                }
            };

            // Events from offline clients are rejected without side effects
            let _ = broker.handle_event(CLIENTS[client], event, &mut transport, now);
            assert_refcounts(&broker);
        }

        for client in CLIENTS {
            transport.take(client);
        }
    }
}

#[test]
fn test_refcounts_after_clean_teardown() {
    let mut t = TestBroker::new(BrokerConfig::default());
    t.connect("a", true);
    t.subscribe("a", "#", QoS::ExactlyOnce);
    t.connect("b", false);
    t.subscribe("b", "x/#", QoS::AtLeastOnce);
    t.send("b", Event::Disconnect);
    t.connect("pub", true);
    t.publish("pub", "x/1", "m", QoS::ExactlyOnce, 9);
    t.send("pub", Event::PubRel(9));
    assert_refcounts(&t.broker);
    assert_eq!(t.broker.store().len(), 1);
    assert_eq!(t.broker.store().iter().next().unwrap().ref_count(), 2);

    t.send("a", Event::ConnectionLost);
    assert_refcounts(&t.broker);
    assert_eq!(t.broker.store().iter().next().unwrap().ref_count(), 1);
}

// ============================================================================
// Persistence
// ============================================================================

type RecordView = (u16, QoS, Direction, DeliveryState, bool);

fn records_of(broker: &Broker, client_id: &str) -> Vec<RecordView> {
    broker
        .session(client_id)
        .map(|s| {
            s.records()
                .map(|r| (r.mid, r.qos, r.direction, r.state, r.dup))
                .collect()
        })
        .unwrap_or_default()
}

fn retained_map(broker: &Broker) -> BTreeMap<String, Bytes> {
    broker
        .subscriptions()
        .retained()
        .into_iter()
        .map(|(topic, id)| {
            let payload = broker.store().get(id).unwrap().message.payload.clone();
            (topic, payload)
        })
        .collect()
}

/// Durable client "sub" frozen mid-handshake:
/// - mid 1: QoS 2 out, PUBREC received (wait_for_pubcomp)
/// - mid 2: QoS 2 out, no answer yet (wait_for_pubrec)
/// - mid 3: QoS 1 out, no answer yet (wait_for_puback)
/// - mid 100: QoS 2 in, PUBREC sent (wait_for_pubrel)
fn frozen_mid_handshake() -> TestBroker {
    let mut t = TestBroker::new(BrokerConfig::default());
    t.connect("sub", false);
    t.subscribe("sub", "t", QoS::ExactlyOnce);
    t.subscribe("sub", "u", QoS::AtLeastOnce);
    t.connect("pub", true);
    t.publish("pub", "t", "m1", QoS::ExactlyOnce, 1);
    t.send("pub", Event::PubRel(1));
    t.publish("pub", "t", "m2", QoS::ExactlyOnce, 2);
    t.send("pub", Event::PubRel(2));
    t.publish("pub", "u", "m3", QoS::AtLeastOnce, 3);
    t.send(
        "pub",
        Event::Publish(Publish::new("r", "kept", QoS::AtMostOnce).retained()),
    );
    t.send("sub", Event::PubRec(1));
    t.publish("sub", "x", "inbound", QoS::ExactlyOnce, 100);
    t.send("sub", Event::ConnectionLost);
    t.received("sub");
    t.received("pub");
    t
}

#[test]
fn test_snapshot_round_trip_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mqttdb.db");

    let mut original = frozen_mid_handshake();
    assert_eq!(
        records_of(&original.broker, "sub"),
        vec![
            (1, QoS::ExactlyOnce, Direction::Out, DeliveryState::WaitForPubcomp, true),
            (2, QoS::ExactlyOnce, Direction::Out, DeliveryState::WaitForPubrec, true),
            (3, QoS::AtLeastOnce, Direction::Out, DeliveryState::WaitForPuback, true),
            (100, QoS::ExactlyOnce, Direction::In, DeliveryState::WaitForPubrel, false),
        ]
    );
    original.broker.save_to(&path, true).unwrap();

    let mut restored = TestBroker::new(BrokerConfig::default());
    assert!(restored.broker.restore_from(&path, restored.now).unwrap());

    assert_eq!(
        records_of(&restored.broker, "sub"),
        records_of(&original.broker, "sub")
    );
    assert_eq!(
        restored.broker.subscriptions().subscriptions(),
        original.broker.subscriptions().subscriptions()
    );
    assert_eq!(retained_map(&restored.broker), retained_map(&original.broker));
    assert_eq!(
        restored.broker.session("sub").unwrap().last_mid(),
        original.broker.session("sub").unwrap().last_mid()
    );
    assert!(restored.broker.session("pub").is_none());
    assert_refcounts(&restored.broker);
}

#[test]
fn test_snapshot_round_trip_resends_after_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mqttdb.db");
    frozen_mid_handshake().broker.save_to(&path, true).unwrap();

    let mut restored = TestBroker::new(BrokerConfig::default());
    restored.broker.restore_from(&path, restored.now).unwrap();
    restored.connect("sub", false);

    assert_eq!(
        restored.received("sub"),
        vec![
            Outgoing::PubRel(1),
            publish_packet(2, "t", "m2", QoS::ExactlyOnce, false, true),
            publish_packet(3, "u", "m3", QoS::AtLeastOnce, false, true),
        ]
    );

    // The held inbound message is forwarded once released
    restored.connect("watch", true);
    restored.subscribe("watch", "x", QoS::AtMostOnce);
    restored.send("sub", Event::PubRel(100));
    assert_eq!(restored.received("sub"), vec![Outgoing::PubComp(100)]);
    assert_eq!(
        restored.received("watch"),
        vec![publish_packet(0, "x", "inbound", QoS::AtMostOnce, false, false)]
    );
    assert_refcounts(&restored.broker);
}

#[test]
fn test_restore_skips_unknown_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mqttdb.db");
    frozen_mid_handshake().broker.save_to(&path, true).unwrap();

    let mut data = BytesMut::from(std::fs::read(&path).unwrap().as_slice());
    data.put_u16(0x7f);
    data.put_u32(3);
    data.put_slice(&[1, 2, 3]);
    std::fs::write(&path, &data).unwrap();

    let mut restored = TestBroker::new(BrokerConfig::default());
    assert!(restored.broker.restore_from(&path, restored.now).unwrap());
    assert_eq!(records_of(&restored.broker, "sub").len(), 4);
}

fn header(version: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(&codec::MAGIC);
    buf.put_u32(0);
    buf.put_u32(version);
    buf
}

fn seeded_broker() -> TestBroker {
    let mut t = TestBroker::new(BrokerConfig::default());
    t.connect("pub", true);
    t.send(
        "pub",
        Event::Publish(Publish::new("keep", "me", QoS::AtMostOnce).retained()),
    );
    t
}

fn restore_error(t: &mut TestBroker, path: &Path) -> PersistenceError {
    match t.broker.restore_from(path, t.now) {
        Err(BrokerError::Persistence(e)) => e,
        other => panic!("expected persistence error, got {:?}", other),
    }
}

#[test]
fn test_restore_rejects_unsupported_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mqttdb.db");
    std::fs::write(&path, header(4)).unwrap();

    let mut t = seeded_broker();
    assert!(matches!(
        restore_error(&mut t, &path),
        PersistenceError::UnsupportedVersion(4)
    ));
    // Live state untouched
    assert_eq!(t.broker.subscriptions().retained_count(), 1);
    assert_eq!(t.broker.session("pub").map(|s| s.is_connected()), Some(true));
}

#[test]
fn test_restore_rejects_bad_magic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mqttdb.db");
    std::fs::write(&path, b"definitely not a snapshot file").unwrap();

    let mut t = seeded_broker();
    assert!(matches!(
        restore_error(&mut t, &path),
        PersistenceError::BadMagic
    ));
}

#[test]
fn test_restore_rejects_dangling_reference() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mqttdb.db");
    let chunks = vec![
        Chunk::Config(StoredConfig {
            shutdown: true,
            id_size: codec::ID_SIZE,
            last_store_id: 5,
        }),
        Chunk::Entry(StoredEntry {
            store_id: 1,
            source_id: "pub".to_string(),
            source_mid: 0,
            mid: 0,
            topic: "t".to_string(),
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: Bytes::from_static(b"x"),
        }),
        Chunk::ClientMessage(StoredClientMessage {
            client_id: "sub".to_string(),
            store_id: 5,
            mid: 1,
            qos: QoS::AtLeastOnce,
            retain: false,
            direction: Direction::Out,
            state: DeliveryState::Queued,
            dup: false,
        }),
    ];
    std::fs::write(&path, codec::encode(&chunks).unwrap()).unwrap();

    let mut t = seeded_broker();
    assert!(matches!(
        restore_error(&mut t, &path),
        PersistenceError::Corrupt(_)
    ));
    assert!(t.broker.session("sub").is_none());
    assert_eq!(t.broker.subscriptions().retained_count(), 1);
}

#[test]
fn test_restore_retained_and_new_ids_continue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mqttdb.db");
    let chunks = vec![
        Chunk::Config(StoredConfig {
            shutdown: false,
            id_size: codec::ID_SIZE,
            last_store_id: 40,
        }),
        Chunk::Retain(StoredRetain { store_id: 7 }),
        Chunk::Entry(StoredEntry {
            store_id: 7,
            source_id: String::new(),
            source_mid: 0,
            mid: 0,
            topic: "home/temp".to_string(),
            qos: QoS::AtLeastOnce,
            retain: true,
            payload: Bytes::from_static(b"21"),
        }),
    ];
    std::fs::write(&path, codec::encode(&chunks).unwrap()).unwrap();

    let mut t = TestBroker::new(BrokerConfig::default());
    assert!(t.broker.restore_from(&path, t.now).unwrap());
    assert_eq!(t.broker.store().last_id(), 40);

    t.connect("sub", true);
    assert_eq!(
        t.subscribe_replay("sub", "home/#", QoS::AtLeastOnce),
        vec![publish_packet(1, "home/temp", "21", QoS::AtLeastOnce, true, false)]
    );
    t.send("sub", Event::PubAck(1));

    t.connect("pub", true);
    t.send(
        "pub",
        Event::Publish(Publish::new("home/temp", "22", QoS::AtMostOnce).retained()),
    );
    let id = t.broker.subscriptions().retained_at("home/temp").unwrap();
    assert_eq!(id, StoreId(41));
    assert_eq!(t.broker.store().len(), 1);
}
