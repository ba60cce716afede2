//! Active topic set.
//!
//! The registry keeps one entry per topic id, in the order topics were first
//! added. Each entry counts its holders (subscription guards and topic-bound
//! handlers); the entry disappears when the last holder releases it or when
//! the topic is unsubscribed explicitly.
//!
//! The registry never touches the connection. Callers decide whether a change
//! has to go on the wire, based on the returned outcome and the connection
//! state.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::identifiers::{HolderId, TopicId};
use crate::protocol::ControlMessage;

// ============================================================================
// Types
// ============================================================================

/// Topic parameters.
pub type Params = BTreeMap<String, String>;

/// Result of [`SubscriptionRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New topic.
    Added,
    /// Known topic, parameters replaced.
    ParamsChanged,
    /// Known topic, same parameters.
    Unchanged,
}

impl AddOutcome {
    /// Returns `true` when a subscribe frame is owed to the server.
    #[inline]
    #[must_use]
    pub const fn needs_subscribe(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// One registered topic.
#[derive(Debug, Clone)]
struct TopicEntry {
    params: Params,
    /// Insertion order.
    seq: u64,
    holders: FxHashSet<HolderId>,
}

// ============================================================================
// SubscriptionRegistry
// ============================================================================

/// Topics the server should be streaming.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: FxHashMap<TopicId, TopicEntry>,
    next_seq: u64,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of topics.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no topic is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if `topic` is registered.
    #[inline]
    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    /// Returns the parameters of a topic.
    #[must_use]
    pub fn params(&self, topic: &str) -> Option<&Params> {
        self.entries.get(topic).map(|entry| &entry.params)
    }

    /// Number of holders of a topic.
    #[must_use]
    pub fn holder_count(&self, topic: &str) -> usize {
        self.entries.get(topic).map_or(0, |entry| entry.holders.len())
    }

    /// Registers `holder` for `topic`, replacing its parameters.
    pub fn add(&mut self, topic: TopicId, params: Params, holder: HolderId) -> AddOutcome {
        if let Some(entry) = self.entries.get_mut(&topic) {
            entry.holders.insert(holder);
            if entry.params == params {
                return AddOutcome::Unchanged;
            }
            entry.params = params;
            return AddOutcome::ParamsChanged;
        }

        self.next_seq += 1;
        let mut holders = FxHashSet::default();
        holders.insert(holder);
        self.entries.insert(
            topic,
            TopicEntry {
                params,
                seq: self.next_seq,
                holders,
            },
        );
        AddOutcome::Added
    }

    /// Drops `holder` from `topic`.
    ///
    /// Returns `true` when that removed the topic.
    pub fn release(&mut self, topic: &str, holder: HolderId) -> bool {
        let Some(entry) = self.entries.get_mut(topic) else {
            return false;
        };
        if !entry.holders.remove(&holder) || !entry.holders.is_empty() {
            return false;
        }
        self.entries.remove(topic);
        true
    }

    /// Removes `topic` regardless of its holders.
    ///
    /// Returns `true` if it was registered.
    pub fn remove(&mut self, topic: &str) -> bool {
        self.entries.remove(topic).is_some()
    }

    /// Topic ids in insertion order.
    #[must_use]
    pub fn topics(&self) -> Vec<TopicId> {
        self.ordered().map(|(topic, _)| topic.clone()).collect()
    }

    /// Subscribe messages for every topic, in insertion order.
    #[must_use]
    pub fn replay_all(&self) -> Vec<ControlMessage> {
        self.ordered()
            .map(|(topic, entry)| ControlMessage::subscribe(topic.clone(), &entry.params))
            .collect()
    }

    fn ordered(&self) -> impl Iterator<Item = (&TopicId, &TopicEntry)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_unstable_by_key(|(_, entry)| entry.seq);
        entries.into_iter()
    }
}

// ============================================================================
// Tests
// ============================================================================
