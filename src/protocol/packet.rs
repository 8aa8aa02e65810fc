//! Decoded client events and outgoing send requests
//!
//! The packet decoder (outside this crate) turns wire packets into [`Event`]s;
//! the broker answers with [`Outgoing`] requests that the transport encodes.

use std::sync::Arc;

use bytes::Bytes;

use super::QoS;

/// Event decoded from a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect(Connect),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    /// Client sent DISCONNECT
    Disconnect,
    /// Network connection closed without DISCONNECT (will is published)
    ConnectionLost,
}

/// CONNECT (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Clean session flag; `false` requests a durable session
    pub clean_session: bool,
    /// Will message (optional)
    pub will: Option<Will>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            clean_session: true,
            will: None,
        }
    }
}

/// Will message configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// PUBLISH (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Packet identifier (ignored for QoS 0)
    pub mid: u16,
    pub dup: bool,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            mid: 0,
            dup: false,
        }
    }

    pub fn with_mid(mut self, mid: u16) -> Self {
        self.mid = mid;
        self
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// Single topic filter in a SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

/// SUBSCRIBE (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub mid: u16,
    pub subscriptions: Vec<Subscription>,
}

impl Subscribe {
    /// Subscribe with a single filter
    pub fn single(mid: u16, filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            mid,
            subscriptions: vec![Subscription {
                filter: filter.into(),
                qos,
            }],
        }
    }
}

/// UNSUBSCRIBE (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub mid: u16,
    pub filters: Vec<String>,
}

/// SUBACK return code for a rejected filter
pub const SUBACK_FAILURE: u8 = 0x80;

/// Send request produced by the broker for the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Publish(OutgoingPublish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    SubAck {
        mid: u16,
        /// Granted QoS per filter, or [`SUBACK_FAILURE`]
        return_codes: Vec<u8>,
    },
    UnsubAck(u16),
}

/// PUBLISH (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPublish {
    pub mid: u16,
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}
