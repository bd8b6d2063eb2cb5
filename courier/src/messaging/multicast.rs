//! Subscribers of multicast publications.
//!
//! A multicast message carries the multicast id in its recipient field. The
//! router fans it out to every subscriber registered here under that id.

use crate::message::ParticipantId;
use dashmap::DashMap;
use std::collections::BTreeSet;

/// Multicast id → subscribed participants.
#[derive(Debug, Default)]
pub struct MulticastReceiverRegistry {
    receivers: DashMap<String, BTreeSet<ParticipantId>>,
}

impl MulticastReceiverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `subscriber_id` to `multicast_id`.
    ///
    /// Returns `false` if the subscription already existed.
    pub fn register(&self, multicast_id: &str, subscriber_id: ParticipantId) -> bool {
        self.receivers
            .entry(multicast_id.to_string())
            .or_default()
            .insert(subscriber_id)
    }

    /// Drop the subscription of `subscriber_id` to `multicast_id`.
    ///
    /// Returns `false` if there was no such subscription.
    pub fn unregister(&self, multicast_id: &str, subscriber_id: &ParticipantId) -> bool {
        let removed = self
            .receivers
            .get_mut(multicast_id)
            .is_some_and(|mut subscribers| subscribers.remove(subscriber_id));
        self.receivers
            .remove_if(multicast_id, |_, subscribers| subscribers.is_empty());
        removed
    }

    /// Current subscribers of `multicast_id`, in id order.
    pub fn receivers(&self, multicast_id: &str) -> Vec<ParticipantId> {
        self.receivers
            .get(multicast_id)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of multicast ids with at least one subscriber.
    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    /// Whether no multicast has subscribers.
    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }
}
