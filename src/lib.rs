//! mqttdb - Message delivery and persistence engine for MQTT brokers
//!
//! A single-threaded core that stores published messages once, fans them
//! out to per-client delivery queues with QoS 0/1/2 acknowledgment tracking,
//! keeps retained messages in the subscription tree and snapshots all of it
//! to a chunked binary file.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod store;
pub mod topic;
pub mod transport;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerStats};
pub use config::Config;
pub use persistence::PersistenceError;
pub use protocol::{Event, Outgoing, QoS};
pub use session::{Ack, AckOutcome, ClientSession, DeliveryState, InsertOutcome, SessionLimits};
pub use store::{MessageStore, StoreError, StoreId};
pub use topic::SubscriptionIndex;
pub use transport::{MemoryTransport, SendError, Transport};
