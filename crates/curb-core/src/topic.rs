//! Topic abstraction.
//!
//! A topic is a named broadcast channel: one per trip (named by the trip's
//! natural key) plus the fixed [`DRIVERS_TOPIC`] that carries every new trip
//! request to all connected drivers.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::event::TripEvent;

/// Name of the broadcast channel all drivers join at connect.
pub const DRIVERS_TOPIC: &str = "drivers";

/// Default broadcast capacity per topic.
const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// A topic identifier: a trip nk or [`DRIVERS_TOPIC`].
pub type TopicId = String;

/// A single broadcast topic.
///
/// Holds the subscriber set and the broadcast sender; both are only reached
/// through the registry's per-topic entry lock, so membership changes and
/// publishes on one topic never race.
#[derive(Debug)]
pub struct Topic {
    /// Topic name.
    name: TopicId,
    /// Broadcast sender for this topic.
    sender: broadcast::Sender<Arc<TripEvent>>,
    /// Set of subscribed connection IDs.
    subscribers: HashSet<String>,
    /// Retired topics are evicted once their subscriber set drains.
    retired: bool,
}

impl Topic {
    /// Create a new topic.
    #[must_use]
    pub fn new(name: impl Into<TopicId>) -> Self {
        Self::with_capacity(name, DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a new topic with a specific broadcast capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<TopicId>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            subscribers: HashSet::new(),
            retired: false,
        }
    }

    /// Get the topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a connection is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &str) -> bool {
        self.subscribers.contains(connection_id)
    }

    /// Subscribe a connection to this topic.
    ///
    /// Returns a receiver for events on this topic.
    pub fn subscribe(
        &mut self,
        connection_id: impl Into<String>,
    ) -> broadcast::Receiver<Arc<TripEvent>> {
        let conn_id = connection_id.into();
        self.subscribers.insert(conn_id.clone());
        debug!(topic = %self.name, connection = %conn_id, "Connection subscribed");
        self.sender.subscribe()
    }

    /// Unsubscribe a connection from this topic.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&mut self, connection_id: &str) -> bool {
        let removed = self.subscribers.remove(connection_id);
        if removed {
            debug!(topic = %self.name, connection = %connection_id, "Connection unsubscribed");
        }
        removed
    }

    /// Publish an event to this topic.
    ///
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: TripEvent) -> usize {
        trace!(topic = %self.name, event = event.id, "Publishing event");
        self.sender.send(Arc::new(event)).unwrap_or_default()
    }

    /// Mark the topic for eviction once its subscriber set drains.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    /// Whether the topic has been retired.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Check if the topic is empty (no subscribers).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
