//! Broker error types

use std::fmt;

use crate::persistence::PersistenceError;
use crate::store::StoreError;

/// Errors surfaced to the event loop
#[derive(Debug)]
pub enum BrokerError {
    /// The message store cannot take another entry
    ResourceExhausted,
    /// Event that cannot be applied (unknown or offline client)
    ProtocolViolation(String),
    /// Snapshot save or restore failed
    Persistence(PersistenceError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ResourceExhausted => write!(f, "resource exhausted"),
            BrokerError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            BrokerError::Persistence(e) => write!(f, "persistence error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for BrokerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ResourceExhausted => BrokerError::ResourceExhausted,
        }
    }
}

impl From<PersistenceError> for BrokerError {
    fn from(e: PersistenceError) -> Self {
        BrokerError::Persistence(e)
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
