//! Topic Trie for subscription matching and retained messages
//!
//! One node per topic level. Filter wildcards get dedicated child slots so a
//! lookup never has to scan the literal children for them; retained entries
//! only ever sit on literal nodes since topic names carry no wildcards.
//!
//! Performance notes:
//! - compact_str keeps short topic levels inline
//! - SmallVec avoids heap allocation when splitting typical topic depths

use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

use crate::protocol::QoS;
use crate::store::StoreId;

/// Subscriber record held by a trie node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub client_id: Arc<str>,
    /// Requested (granted) QoS
    pub qos: QoS,
}

#[derive(Debug, Default)]
struct TrieNode {
    /// Subscribers whose filter ends at this node, in subscription order
    subscribers: Vec<Subscriber>,
    /// Retained message for the topic ending at this node
    retained: Option<StoreId>,
    children: AHashMap<CompactString, TrieNode>,
    /// `+` child
    single_wildcard: Option<Box<TrieNode>>,
    /// `#` child
    multi_wildcard: Option<Box<TrieNode>>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
            && self.retained.is_none()
            && self.children.is_empty()
            && self.single_wildcard.is_none()
            && self.multi_wildcard.is_none()
    }

    fn child_mut(&mut self, level: &str) -> &mut TrieNode {
        match level {
            "+" => self.single_wildcard.get_or_insert_with(Box::default),
            "#" => self.multi_wildcard.get_or_insert_with(Box::default),
            _ => self.children.entry(CompactString::new(level)).or_default(),
        }
    }

    fn child(&self, level: &str) -> Option<&TrieNode> {
        match level {
            "+" => self.single_wildcard.as_deref(),
            "#" => self.multi_wildcard.as_deref(),
            _ => self.children.get(level),
        }
    }

    fn child_entry(&mut self, level: &str) -> Option<&mut TrieNode> {
        match level {
            "+" => self.single_wildcard.as_deref_mut(),
            "#" => self.multi_wildcard.as_deref_mut(),
            _ => self.children.get_mut(level),
        }
    }

    fn drop_child(&mut self, level: &str) {
        match level {
            "+" => self.single_wildcard = None,
            "#" => self.multi_wildcard = None,
            _ => {
                self.children.remove(level);
            }
        }
    }
}

/// Topic tree holding both subscriptions and retained message slots
#[derive(Debug, Default)]
pub struct TopicTrie {
    root: TrieNode,
}

impl TopicTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a subscriber at a filter.
    ///
    /// Returns true if the client had no subscription on this filter yet.
    pub fn subscribe(&mut self, filter: &str, client_id: &Arc<str>, qos: QoS) -> bool {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            node = node.child_mut(level);
        }

        if let Some(existing) = node
            .subscribers
            .iter_mut()
            .find(|s| s.client_id == *client_id)
        {
            existing.qos = qos;
            return false;
        }
        node.subscribers.push(Subscriber {
            client_id: client_id.clone(),
            qos,
        });
        true
    }

    /// Remove a client's subscriber record at a filter, pruning emptied nodes.
    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let mut removed = false;
        Self::update_path(&mut self.root, &levels, &mut |node| {
            let before = node.subscribers.len();
            node.subscribers.retain(|s| s.client_id.as_ref() != client_id);
            removed = node.subscribers.len() != before;
        });
        removed
    }

    /// Remove every subscription held by a client. Returns how many were removed.
    pub fn unsubscribe_all(&mut self, client_id: &str) -> usize {
        Self::unsubscribe_all_recursive(&mut self.root, client_id)
    }

    fn unsubscribe_all_recursive(node: &mut TrieNode, client_id: &str) -> usize {
        let before = node.subscribers.len();
        node.subscribers.retain(|s| s.client_id.as_ref() != client_id);
        let mut removed = before - node.subscribers.len();

        for child in node.children.values_mut() {
            removed += Self::unsubscribe_all_recursive(child, client_id);
        }
        node.children.retain(|_, child| !child.is_empty());

        if let Some(child) = node.single_wildcard.as_deref_mut() {
            removed += Self::unsubscribe_all_recursive(child, client_id);
            if child.is_empty() {
                node.single_wildcard = None;
            }
        }
        if let Some(child) = node.multi_wildcard.as_deref_mut() {
            removed += Self::unsubscribe_all_recursive(child, client_id);
            if child.is_empty() {
                node.multi_wildcard = None;
            }
        }
        removed
    }

    /// Walk to the node at `levels`, apply `f`, then prune empty nodes on
    /// the way back up. Nothing is created when the path does not exist.
    fn update_path<F>(node: &mut TrieNode, levels: &[&str], f: &mut F)
    where
        F: FnMut(&mut TrieNode),
    {
        let Some((level, rest)) = levels.split_first() else {
            f(node);
            return;
        };
        let Some(child) = node.child_entry(level) else {
            return;
        };
        Self::update_path(child, rest, f);
        if child.is_empty() {
            node.drop_child(level);
        }
    }

    /// Collect subscribers whose filter matches a topic name
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscriber; 16]> {
        // $-topics don't match filters starting with + or #
        let is_system_topic = topic.starts_with('$');

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let mut result = SmallVec::new();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut result);
        result
    }

    fn matches_recursive(
        node: &TrieNode,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        result: &mut SmallVec<[Subscriber; 16]>,
    ) {
        let wildcards_allowed = !(is_system_topic && index == 0);

        // `#` also matches the parent level itself
        if wildcards_allowed {
            if let Some(ref multi) = node.multi_wildcard {
                result.extend(multi.subscribers.iter().cloned());
            }
        }

        if index >= levels.len() {
            result.extend(node.subscribers.iter().cloned());
            return;
        }

        if wildcards_allowed {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, result);
            }
        }

        if let Some(child) = node.children.get(levels[index]) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, result);
        }
    }

    /// Retained entry stored at an exact topic
    pub fn retained_at(&self, topic: &str) -> Option<StoreId> {
        let mut node = &self.root;
        for level in topic.split('/') {
            node = node.child(level)?;
        }
        node.retained
    }

    /// Replace the retained slot of a topic, returning the previous entry.
    ///
    /// `None` clears the slot and prunes the path if it became empty.
    pub fn replace_retained(&mut self, topic: &str, id: Option<StoreId>) -> Option<StoreId> {
        match id {
            Some(id) => {
                let mut node = &mut self.root;
                for level in topic.split('/') {
                    node = node.child_mut(level);
                }
                node.retained.replace(id)
            }
            None => {
                let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
                let mut previous = None;
                Self::update_path(&mut self.root, &levels, &mut |node| {
                    previous = node.retained.take();
                });
                previous
            }
        }
    }

    /// Retained entries whose topic matches a subscription filter
    pub fn retained_matching(&self, filter: &str) -> Vec<StoreId> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let mut result = Vec::new();
        Self::retained_recursive(&self.root, &levels, 0, &mut result);
        result
    }

    fn retained_recursive(node: &TrieNode, levels: &[&str], index: usize, out: &mut Vec<StoreId>) {
        if index >= levels.len() {
            out.extend(node.retained);
            return;
        }

        match levels[index] {
            "#" => {
                // Zero levels: the parent topic itself
                if index > 0 {
                    out.extend(node.retained);
                }
                for (level, child) in &node.children {
                    if index == 0 && level.starts_with('$') {
                        continue;
                    }
                    Self::collect_retained(child, out);
                }
            }
            "+" => {
                for (level, child) in &node.children {
                    if index == 0 && level.starts_with('$') {
                        continue;
                    }
                    Self::retained_recursive(child, levels, index + 1, out);
                }
            }
            level => {
                if let Some(child) = node.children.get(level) {
                    Self::retained_recursive(child, levels, index + 1, out);
                }
            }
        }
    }

    fn collect_retained(node: &TrieNode, out: &mut Vec<StoreId>) {
        out.extend(node.retained);
        for child in node.children.values() {
            Self::collect_retained(child, out);
        }
    }

    /// Depth-first visit of every subscriber and retained slot.
    ///
    /// The callback receives the topic path of the node, its subscribers and
    /// its retained entry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &[Subscriber], Option<StoreId>),
    {
        let mut path = String::new();
        Self::for_each_recursive(&self.root, &mut path, true, &mut f);
    }

    fn for_each_recursive<F>(node: &TrieNode, path: &mut String, is_root: bool, f: &mut F)
    where
        F: FnMut(&str, &[Subscriber], Option<StoreId>),
    {
        if !is_root && (!node.subscribers.is_empty() || node.retained.is_some()) {
            f(path, &node.subscribers, node.retained);
        }

        // Sorted so snapshots are deterministic
        let mut children: Vec<(&str, &TrieNode)> = node
            .children
            .iter()
            .map(|(level, child)| (level.as_str(), child))
            .collect();
        children.sort_by(|a, b| a.0.cmp(b.0));
        if let Some(ref child) = node.single_wildcard {
            children.push(("+", child));
        }
        if let Some(ref child) = node.multi_wildcard {
            children.push(("#", child));
        }

        for (level, child) in children {
            let len = path.len();
            if !is_root {
                path.push('/');
            }
            path.push_str(level);
            Self::for_each_recursive(child, path, false, f);
            path.truncate(len);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::topic_matches_filter;
    use proptest::prelude::*;

    fn client(id: &str) -> Arc<str> {
        Arc::from(id)
    }

    fn matched(trie: &TopicTrie, topic: &str) -> Vec<String> {
        let mut ids: Vec<String> = trie
            .matches(topic)
            .iter()
            .map(|s| s.client_id.to_string())
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_exact_match() {
        let mut trie = TopicTrie::new();
        trie.subscribe("test/topic", &client("a"), QoS::AtMostOnce);

        assert_eq!(matched(&trie, "test/topic"), vec!["a"]);
        assert!(matched(&trie, "test/other").is_empty());
        assert!(matched(&trie, "test").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut trie = TopicTrie::new();
        trie.subscribe("test/+", &client("a"), QoS::AtMostOnce);
        trie.subscribe("+/topic", &client("b"), QoS::AtMostOnce);
        trie.subscribe("+/+", &client("c"), QoS::AtMostOnce);

        assert_eq!(matched(&trie, "test/topic"), vec!["a", "b", "c"]);
        assert!(matched(&trie, "test/topic/deep").is_empty());
    }

    #[test]
    fn test_multi_wildcard() {
        let mut trie = TopicTrie::new();
        trie.subscribe("#", &client("a"), QoS::AtMostOnce);
        trie.subscribe("test/#", &client("b"), QoS::AtMostOnce);

        assert_eq!(matched(&trie, "test/topic/deep"), vec!["a", "b"]);
        // `test/#` covers `test` itself
        assert_eq!(matched(&trie, "test"), vec!["a", "b"]);
    }

    #[test]
    fn test_system_topics() {
        let mut trie = TopicTrie::new();
        trie.subscribe("#", &client("a"), QoS::AtMostOnce);
        trie.subscribe("+/test", &client("b"), QoS::AtMostOnce);
        trie.subscribe("$SYS/#", &client("c"), QoS::AtMostOnce);

        assert_eq!(matched(&trie, "$SYS/test"), vec!["c"]);
    }

    #[test]
    fn test_resubscribe_updates_qos() {
        let mut trie = TopicTrie::new();
        let a = client("a");
        assert!(trie.subscribe("x/y", &a, QoS::AtMostOnce));
        assert!(!trie.subscribe("x/y", &a, QoS::ExactlyOnce));

        let subs = trie.matches("x/y");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_unsubscribe_prunes() {
        let mut trie = TopicTrie::new();
        trie.subscribe("a/+/c", &client("x"), QoS::AtLeastOnce);

        assert!(!trie.unsubscribe("a/+/c", "other"));
        assert!(!trie.unsubscribe("a/b", "x"));
        assert!(trie.unsubscribe("a/+/c", "x"));
        assert!(trie.is_empty());
    }

    #[test]
    fn test_unsubscribe_all() {
        let mut trie = TopicTrie::new();
        let x = client("x");
        trie.subscribe("a", &x, QoS::AtMostOnce);
        trie.subscribe("a/#", &x, QoS::AtMostOnce);
        trie.subscribe("a", &client("y"), QoS::AtMostOnce);

        assert_eq!(trie.unsubscribe_all("x"), 2);
        assert_eq!(matched(&trie, "a"), vec!["y"]);
    }

    #[test]
    fn test_retained_slot() {
        let mut trie = TopicTrie::new();
        assert_eq!(trie.replace_retained("a/b", Some(StoreId(1))), None);
        assert_eq!(trie.replace_retained("a/b", Some(StoreId(2))), Some(StoreId(1)));
        assert_eq!(trie.retained_at("a/b"), Some(StoreId(2)));

        assert_eq!(trie.replace_retained("a/b", None), Some(StoreId(2)));
        assert_eq!(trie.retained_at("a/b"), None);
        assert!(trie.is_empty());
    }

    #[test]
    fn test_retained_matching() {
        let mut trie = TopicTrie::new();
        trie.replace_retained("a", Some(StoreId(1)));
        trie.replace_retained("a/b", Some(StoreId(2)));
        trie.replace_retained("a/b/c", Some(StoreId(3)));
        trie.replace_retained("$SYS/x", Some(StoreId(4)));

        let sorted = |mut v: Vec<StoreId>| {
            v.sort();
            v
        };
        assert_eq!(
            sorted(trie.retained_matching("a/#")),
            vec![StoreId(1), StoreId(2), StoreId(3)]
        );
        assert_eq!(trie.retained_matching("a/+"), vec![StoreId(2)]);
        assert_eq!(
            sorted(trie.retained_matching("#")),
            vec![StoreId(1), StoreId(2), StoreId(3)]
        );
        assert_eq!(trie.retained_matching("+/x"), vec![]);
        assert_eq!(trie.retained_matching("$SYS/#"), vec![StoreId(4)]);
    }

    #[test]
    fn test_for_each_paths() {
        let mut trie = TopicTrie::new();
        trie.subscribe("a/+/#", &client("x"), QoS::AtLeastOnce);
        trie.replace_retained("a/b", Some(StoreId(9)));

        let mut seen = Vec::new();
        trie.for_each(|path, subs, retained| {
            seen.push((path.to_string(), subs.len(), retained));
        });
        assert_eq!(
            seen,
            vec![
                ("a/b".to_string(), 0, Some(StoreId(9))),
                ("a/+/#".to_string(), 1, None),
            ]
        );
    }

    fn topic_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec(prop::sample::select(vec!["a", "b", "$SYS"]), 1..4)
            .prop_map(|levels| levels.join("/"))
    }

    fn filter_strategy() -> impl Strategy<Value = String> {
        (
            prop::collection::vec(prop::sample::select(vec!["a", "b", "$SYS", "+"]), 0..4),
            any::<bool>(),
        )
            .prop_filter("filter has at least one level", |(levels, multi)| {
                !levels.is_empty() || *multi
            })
            .prop_map(|(mut levels, multi)| {
                if multi {
                    levels.push("#");
                }
                levels.join("/")
            })
    }

    proptest! {
        #[test]
        fn prop_trie_agrees_with_string_matcher(
            filters in prop::collection::vec(filter_strategy(), 1..8),
            topics in prop::collection::btree_set(topic_strategy(), 1..8),
        ) {
            let mut trie = TopicTrie::new();
            for (i, filter) in filters.iter().enumerate() {
                trie.subscribe(filter, &client(&format!("c{}", i)), QoS::AtMostOnce);
            }
            let topics: Vec<String> = topics.into_iter().collect();
            for (i, topic) in topics.iter().enumerate() {
                trie.replace_retained(topic, Some(StoreId(i as u64 + 1)));
            }

            for topic in &topics {
                let mut expected: Vec<String> = filters
                    .iter()
                    .enumerate()
                    .filter(|(_, f)| topic_matches_filter(topic, f))
                    .map(|(i, _)| format!("c{}", i))
                    .collect();
                expected.sort();
                prop_assert_eq!(matched(&trie, topic), expected, "topic {}", topic);
            }

            for filter in &filters {
                let mut expected: Vec<StoreId> = topics
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| topic_matches_filter(t, filter))
                    .map(|(i, _)| StoreId(i as u64 + 1))
                    .collect();
                expected.sort();
                let mut found = trie.retained_matching(filter);
                found.sort();
                prop_assert_eq!(found, expected, "filter {}", filter);
            }
        }
    }
}
