//! Desired vs. active topic subscriptions
//!
//! The registry is plain bookkeeping: `reconcile` computes what to change,
//! and the connection manager reports back with `mark_active` /
//! `mark_inactive` once the broker calls resolve. Nothing here talks to the
//! broker.

use crate::config::{SubscriptionMode, SubscriptionSection};
use crate::protocol::topics::{
    device_topic, normalize_base_topic, normalize_device_id, validate_topic_filter,
    wildcard_topic,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// One tracked topic filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    pub topic_pattern: String,
    pub active: bool,
}

/// Result of a reconciliation pass, as topic filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileDelta {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl ReconcileDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionRegistry {
    mode: SubscriptionMode,
    base_topic: String,
    static_topics: BTreeSet<String>,
    entries: BTreeMap<String, TopicSubscription>,
    /// Filters added through `track`; reconciliation never removes these
    pinned: BTreeSet<String>,
    known_devices: BTreeSet<String>,
}

impl SubscriptionRegistry {
    pub fn new(mode: SubscriptionMode, base_topic: &str, static_topics: &[String]) -> Self {
        let static_topics = static_topics
            .iter()
            .map(|topic| topic.trim().to_string())
            .filter(|topic| match validate_topic_filter(topic) {
                Ok(()) => true,
                Err(e) => {
                    warn!(%topic, "Ignoring static topic: {}", e);
                    false
                }
            })
            .collect();

        Self {
            mode,
            base_topic: normalize_base_topic(base_topic),
            static_topics,
            entries: BTreeMap::new(),
            pinned: BTreeSet::new(),
            known_devices: BTreeSet::new(),
        }
    }

    pub fn from_config(section: &SubscriptionSection) -> Self {
        Self::new(section.mode, &section.base_topic, &section.static_topics)
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    /// Topic filters wanted for a set of (already normalized) device ids
    pub fn desired_topics(&self, device_ids: &BTreeSet<String>) -> BTreeSet<String> {
        let mut topics = self.static_topics.clone();
        match self.mode {
            SubscriptionMode::PerDevice => {
                topics.extend(device_ids.iter().map(|id| device_topic(&self.base_topic, id)));
            }
            SubscriptionMode::Wildcard => {
                topics.insert(wildcard_topic(&self.base_topic));
            }
        }
        topics
    }

    /// Reconcile the tracked set against the desired device ids.
    ///
    /// Ids are trimmed and empties discarded. Newly desired topics are
    /// tracked as inactive and returned in `added`; topics no longer desired
    /// stop being tracked and are returned in `removed`. Pinned filters are
    /// left alone.
    pub fn reconcile<I, S>(&mut self, desired_device_ids: I) -> ReconcileDelta
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let device_ids: BTreeSet<String> = desired_device_ids
            .into_iter()
            .filter_map(|id| normalize_device_id(id.as_ref()))
            .collect();
        let desired = self.desired_topics(&device_ids);

        let removed: BTreeSet<String> = self
            .entries
            .keys()
            .filter(|topic| !desired.contains(*topic) && !self.pinned.contains(*topic))
            .cloned()
            .collect();
        for topic in &removed {
            self.entries.remove(topic);
        }

        let mut added = BTreeSet::new();
        for topic in desired {
            if !self.entries.contains_key(&topic) {
                self.entries.insert(
                    topic.clone(),
                    TopicSubscription {
                        topic_pattern: topic.clone(),
                        active: false,
                    },
                );
                added.insert(topic);
            }
        }

        self.known_devices = device_ids;
        ReconcileDelta { added, removed }
    }

    /// Track and pin a single filter outside reconciliation. Returns false
    /// if it was already tracked.
    pub fn track(&mut self, topic: &str) -> bool {
        self.pinned.insert(topic.to_string());
        if self.entries.contains_key(topic) {
            return false;
        }
        self.entries.insert(
            topic.to_string(),
            TopicSubscription {
                topic_pattern: topic.to_string(),
                active: false,
            },
        );
        true
    }

    /// Record a successful subscribe. Returns false for untracked filters.
    pub fn mark_active(&mut self, topic: &str) -> bool {
        match self.entries.get_mut(topic) {
            Some(entry) => {
                entry.active = true;
                true
            }
            None => false,
        }
    }

    /// Record a failed subscribe or a lost session for one filter
    pub fn mark_inactive(&mut self, topic: &str) -> bool {
        match self.entries.get_mut(topic) {
            Some(entry) => {
                entry.active = false;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, topic: &str) -> bool {
        self.entries.get(topic).is_some_and(|entry| entry.active)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn active_topics(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|entry| entry.active)
            .map(|entry| entry.topic_pattern.clone())
            .collect()
    }

    pub fn inactive_topics(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|entry| !entry.active)
            .map(|entry| entry.topic_pattern.clone())
            .collect()
    }

    pub fn tracked_topics(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn pinned_topics(&self) -> &BTreeSet<String> {
        &self.pinned
    }

    pub fn entries(&self) -> impl Iterator<Item = &TopicSubscription> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Device ids from the last reconciliation
    pub fn known_devices(&self) -> &BTreeSet<String> {
        &self.known_devices
    }
}
