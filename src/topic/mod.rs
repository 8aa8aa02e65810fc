//! Topic matching and subscription management
//!
//! Implements topic name/filter validation and the subscription tree. The
//! tree doubles as the retained-message index: each topic node can hold one
//! counted reference into the [`MessageStore`].

mod trie;
pub mod validation;

pub use trie::{Subscriber, TopicTrie};
pub use validation::{
    is_sys_topic, topic_matches_filter, validate_topic_filter, validate_topic_name,
};

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::protocol::QoS;
use crate::store::{MessageStore, StoreId};

/// A persisted subscription, produced by [`SubscriptionIndex::subscriptions`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub client_id: Arc<str>,
    pub filter: String,
    pub qos: QoS,
}

/// Subscription tree plus retained message slots
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    trie: TopicTrie,
    subscription_count: usize,
    retained_count: usize,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a client to a filter, updating the QoS on resubscribe.
    ///
    /// Returns true if the subscription is new.
    pub fn add(&mut self, client_id: &Arc<str>, filter: &str, qos: QoS) -> bool {
        let added = self.trie.subscribe(filter, client_id, qos);
        if added {
            self.subscription_count += 1;
        }
        debug!(
            "Subscribed '{}' to '{}' (QoS {:?}{})",
            client_id,
            filter,
            qos,
            if added { "" } else { ", updated" }
        );
        added
    }

    /// Remove one subscription. Returns false if the client had none on `filter`.
    pub fn remove(&mut self, client_id: &str, filter: &str) -> bool {
        let removed = self.trie.unsubscribe(filter, client_id);
        if removed {
            self.subscription_count -= 1;
            debug!("Unsubscribed '{}' from '{}'", client_id, filter);
        }
        removed
    }

    /// Remove every subscription held by a client
    pub fn remove_client(&mut self, client_id: &str) -> usize {
        let removed = self.trie.unsubscribe_all(client_id);
        self.subscription_count -= removed;
        if removed > 0 {
            debug!("Removed {} subscriptions of '{}'", removed, client_id);
        }
        removed
    }

    /// Subscribers matching a topic name
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscriber; 16]> {
        self.trie.matches(topic)
    }

    /// Make `id` the retained message for `topic`.
    ///
    /// An entry with an empty payload clears the slot instead. The previous
    /// retained entry, if any, loses its reference.
    pub fn set_retained(&mut self, store: &mut MessageStore, topic: &str, id: StoreId) {
        let clears = store
            .get(id)
            .map_or(true, |entry| entry.message.payload.is_empty());

        let previous = if clears {
            self.trie.replace_retained(topic, None)
        } else {
            store.acquire(id);
            self.trie.replace_retained(topic, Some(id))
        };

        match (previous, clears) {
            (Some(old), _) => {
                store.release(old);
                if clears {
                    self.retained_count -= 1;
                }
            }
            (None, false) => self.retained_count += 1,
            (None, true) => {}
        }
        trace!(
            "Retained on '{}' {}",
            topic,
            if clears { "cleared" } else { "set" }
        );
    }

    /// Retained entry at an exact topic
    pub fn retained_at(&self, topic: &str) -> Option<StoreId> {
        self.trie.retained_at(topic)
    }

    /// Retained entries that a subscription on `filter` should receive
    pub fn retained_matching(&self, filter: &str) -> Vec<StoreId> {
        self.trie.retained_matching(filter)
    }

    /// Every subscription, depth-first
    pub fn subscriptions(&self) -> Vec<SubscriptionEntry> {
        let mut out = Vec::with_capacity(self.subscription_count);
        self.trie.for_each(|path, subscribers, _| {
            out.extend(subscribers.iter().map(|s| SubscriptionEntry {
                client_id: s.client_id.clone(),
                filter: path.to_string(),
                qos: s.qos,
            }));
        });
        out
    }

    /// Every retained slot as (topic, entry), depth-first
    pub fn retained(&self) -> Vec<(String, StoreId)> {
        let mut out = Vec::with_capacity(self.retained_count);
        self.trie.for_each(|path, _, retained| {
            if let Some(id) = retained {
                out.push((path.to_string(), id));
            }
        });
        out
    }

    /// Drop every retained reference held by the tree
    pub fn clear_retained(&mut self, store: &mut MessageStore) {
        for (topic, id) in self.retained() {
            self.trie.replace_retained(&topic, None);
            store.release(id);
        }
        self.retained_count = 0;
    }

    pub fn subscription_count(&self) -> usize {
        self.subscription_count
    }

    pub fn retained_count(&self) -> usize {
        self.retained_count
    }
}
