//! Transport Layer
//!
//! The delivery engine never touches sockets. Every send request goes through
//! a [`Transport`], which encodes and queues it without blocking.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;

use crate::protocol::Outgoing;

/// Transport send failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Write cannot complete right now; retry on a later loop pass
    WouldBlock,
    /// Connection is gone
    Closed,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::WouldBlock => write!(f, "write would block"),
            SendError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Non-blocking outbound packet sink
pub trait Transport {
    /// Queue a packet for a connected client.
    ///
    /// Must not block; return [`SendError::WouldBlock`] when the write buffer
    /// is full.
    fn send(&mut self, client_id: &str, packet: Outgoing) -> Result<(), SendError>;
}

/// In-memory transport that records every packet per client.
///
/// Used by tests and tools. A per-client budget can be set to simulate a
/// socket whose write buffer fills up.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: AHashMap<Arc<str>, VecDeque<Outgoing>>,
    budgets: AHashMap<Arc<str>, usize>,
    closed: Vec<Arc<str>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow only `packets` more sends to `client_id` before returning `WouldBlock`
    pub fn set_budget(&mut self, client_id: &str, packets: usize) {
        self.budgets.insert(client_id.into(), packets);
    }

    /// Remove any send budget for `client_id`
    pub fn clear_budget(&mut self, client_id: &str) {
        self.budgets.remove(client_id);
    }

    /// Make every send to `client_id` fail with `Closed`
    pub fn close(&mut self, client_id: &str) {
        self.closed.push(client_id.into());
    }

    /// Take everything sent to `client_id` so far
    pub fn take(&mut self, client_id: &str) -> Vec<Outgoing> {
        self.sent
            .get_mut(client_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of packets waiting for `client_id`
    pub fn pending(&self, client_id: &str) -> usize {
        self.sent.get(client_id).map_or(0, |q| q.len())
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, client_id: &str, packet: Outgoing) -> Result<(), SendError> {
        if self.closed.iter().any(|c| c.as_ref() == client_id) {
            return Err(SendError::Closed);
        }
        if let Some(budget) = self.budgets.get_mut(client_id) {
            if *budget == 0 {
                return Err(SendError::WouldBlock);
            }
            *budget -= 1;
        }
        self.sent
            .entry(Arc::from(client_id))
            .or_default()
            .push_back(packet);
        Ok(())
    }
}
