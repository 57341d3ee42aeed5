use std::collections::HashMap;

use super::MessageCallback;
use crate::error::SubscriptionError;
use crate::topic::{MatchMode, TopicMatcher};

struct Entry {
    callback: MessageCallback,
    active: bool,
    matcher: TopicMatcher,
}

/// Topic filter → callback table consulted for every incoming message.
///
/// Entries are inserted inactive while the broker acknowledgement is
/// outstanding; only active entries receive messages.
pub struct SubscriptionMap {
    mode: MatchMode,
    entries: HashMap<String, Entry>,
}

impl SubscriptionMap {
    pub fn new(mode: MatchMode) -> Self {
        SubscriptionMap {
            mode,
            entries: HashMap::new(),
        }
    }

    pub fn insert_pending(
        &mut self,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<(), SubscriptionError> {
        if self.entries.contains_key(topic) {
            return Err(SubscriptionError::AlreadySubscribed(topic.to_string()));
        }
        self.entries.insert(
            topic.to_string(),
            Entry {
                callback,
                active: false,
                matcher: TopicMatcher::new(topic, self.mode),
            },
        );
        Ok(())
    }

    pub fn activate(&mut self, topic: &str) -> bool {
        match self.entries.get_mut(topic) {
            Some(entry) => {
                entry.active = true;
                true
            }
            None => false,
        }
    }

    /// Stops delivery for `topic` while an unsubscribe is in flight.
    pub fn deactivate(&mut self, topic: &str) -> Result<(), SubscriptionError> {
        match self.entries.get_mut(topic) {
            Some(entry) if entry.active => {
                entry.active = false;
                Ok(())
            }
            _ => Err(SubscriptionError::NotSubscribed(topic.to_string())),
        }
    }

    /// Reactivates an entry whose unsubscribe failed.
    pub fn restore(&mut self, topic: &str) {
        self.activate(topic);
    }

    pub fn remove(&mut self, topic: &str) -> bool {
        self.entries.remove(topic).is_some()
    }

    /// Registers `topic` as active with `callback`, replacing any existing
    /// entry.
    pub fn grant(&mut self, topic: &str, callback: MessageCallback) {
        self.entries.insert(
            topic.to_string(),
            Entry {
                callback,
                active: true,
                matcher: TopicMatcher::new(topic, self.mode),
            },
        );
    }

    pub fn is_active(&self, topic: &str) -> bool {
        self.entries.get(topic).is_some_and(|e| e.active)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    /// Callbacks of every active filter matching `topic`. A filter that does
    /// not match never prevents the others from being checked.
    pub fn matching_callbacks(&self, topic: &str) -> Vec<MessageCallback> {
        self.entries
            .values()
            .filter(|entry| entry.active && entry.matcher.matches(topic))
            .map(|entry| entry.callback.clone())
            .collect()
    }

    pub fn active_topics(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
