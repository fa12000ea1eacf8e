//! Subscription registry.
//!
//! The registry is the only shared mutable structure in the engine: it maps
//! topics to subscriber sets and fans trip events out to them. All
//! connection handlers hold the same `Arc<SubscriptionRegistry>` and reach
//! its state exclusively through this API.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::event::TripEvent;
use crate::topic::{Topic, TopicId, DRIVERS_TOPIC};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Maximum subscriptions per connection reached.
    #[error("Maximum subscriptions reached for connection {0}")]
    MaxSubscriptionsReached(String),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
    /// Broadcast capacity per topic. A subscriber that lags past this many
    /// buffered events loses its oldest ones; nobody else is affected.
    pub topic_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 64,
            topic_capacity: 256,
        }
    }
}

/// Receiver half of a topic subscription.
pub type TopicReceiver = broadcast::Receiver<Arc<TripEvent>>;

/// The central subscription registry.
///
/// Topics are created implicitly on first subscribe. A trip topic lives
/// until it is both retired (its trip completed) and empty; the `drivers`
/// topic exists from startup and is never evicted.
pub struct SubscriptionRegistry {
    /// Topics indexed by name.
    topics: DashMap<TopicId, Topic>,
    /// Connection subscriptions (connection_id -> set of topic names).
    subscriptions: DashMap<String, DashSet<TopicId>>,
    /// Configuration.
    config: RegistryConfig,
}

impl SubscriptionRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating subscription registry with config: {:?}", config);
        let registry = Self {
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            config,
        };
        // The drivers topic outlives any individual subscriber.
        registry.topics.insert(
            DRIVERS_TOPIC.to_string(),
            Topic::with_capacity(DRIVERS_TOPIC, registry.config.topic_capacity),
        );
        registry
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            topic_count: self.topics.len(),
            connection_count: self.subscriptions.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }

    /// Subscribe a connection to a topic.
    ///
    /// Idempotent: the first call returns a receiver for the topic's events,
    /// a repeat call for the same pair is a no-op returning `None` (the
    /// caller already holds a live receiver).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection's subscription limit is reached.
    pub fn subscribe(
        &self,
        connection_id: &str,
        topic_name: &str,
    ) -> Result<Option<TopicReceiver>, RegistryError> {
        let conn_subs = self
            .subscriptions
            .entry(connection_id.to_string())
            .or_default();

        if conn_subs.contains(topic_name) {
            trace!(topic = %topic_name, connection = %connection_id, "Already subscribed");
            return Ok(None);
        }

        if conn_subs.len() >= self.config.max_subscriptions_per_connection {
            return Err(RegistryError::MaxSubscriptionsReached(
                connection_id.to_string(),
            ));
        }

        // Get or create topic
        let mut entry = self
            .topics
            .entry(topic_name.to_string())
            .or_insert_with(|| {
                debug!(topic = %topic_name, "Creating new topic");
                Topic::with_capacity(topic_name, self.config.topic_capacity)
            });

        let receiver = entry.subscribe(connection_id);
        conn_subs.insert(topic_name.to_string());

        debug!(
            topic = %topic_name,
            connection = %connection_id,
            subscribers = entry.subscriber_count(),
            "Subscribed"
        );

        Ok(Some(receiver))
    }

    /// Unsubscribe a connection from a topic. Idempotent.
    pub fn unsubscribe(&self, connection_id: &str, topic_name: &str) {
        let was_subscribed = self
            .subscriptions
            .get(connection_id)
            .is_some_and(|conn_subs| conn_subs.remove(topic_name).is_some());
        if !was_subscribed {
            return;
        }

        if let Some(mut entry) = self.topics.get_mut(topic_name) {
            entry.unsubscribe(connection_id);

            debug!(
                topic = %topic_name,
                connection = %connection_id,
                subscribers = entry.subscriber_count(),
                "Unsubscribed"
            );

            if entry.is_empty() && entry.is_retired() {
                drop(entry); // Release the lock
                self.topics.remove(topic_name);
                debug!(topic = %topic_name, "Evicted retired topic");
            }
        }
    }

    /// Unsubscribe a connection from all topics (used at disconnect).
    pub fn unsubscribe_all(&self, connection_id: &str) {
        if let Some((_, topics)) = self.subscriptions.remove(connection_id) {
            for topic_name in topics.iter() {
                if let Some(mut entry) = self.topics.get_mut(topic_name.as_str()) {
                    entry.unsubscribe(connection_id);

                    if entry.is_empty() && entry.is_retired() {
                        let name = topic_name.clone();
                        drop(entry);
                        self.topics.remove(&name);
                        debug!(topic = %name, "Evicted retired topic");
                    }
                }
            }
        }

        debug!(connection = %connection_id, "Unsubscribed from all topics");
    }

    /// Broadcast an event to a topic.
    ///
    /// Delivers to every receiver handed out by a `subscribe` call that
    /// completed before this call began. Per-subscriber failures (closed or
    /// lagging receivers) are isolated. Returns the recipient count.
    pub fn broadcast(&self, topic_name: &str, event: TripEvent) -> usize {
        if let Some(entry) = self.topics.get(topic_name) {
            let count = entry.publish(event);
            trace!(topic = %topic_name, recipients = count, "Broadcast event");
            count
        } else {
            warn!(topic = %topic_name, "Broadcast to non-existent topic");
            0
        }
    }

    /// Retire a topic: once its subscriber set drains it is evicted.
    ///
    /// The `drivers` topic is never retired.
    pub fn retire(&self, topic_name: &str) {
        if topic_name == DRIVERS_TOPIC {
            return;
        }
        if let Some(mut entry) = self.topics.get_mut(topic_name) {
            entry.retire();
            debug!(topic = %topic_name, "Retired topic");

            if entry.is_empty() {
                drop(entry);
                self.topics.remove(topic_name);
                debug!(topic = %topic_name, "Evicted retired topic");
            }
        }
    }

    /// Check if a topic exists.
    #[must_use]
    pub fn topic_exists(&self, topic_name: &str) -> bool {
        self.topics.contains_key(topic_name)
    }

    /// Get the subscriber count for a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic_name: &str) -> usize {
        self.topics
            .get(topic_name)
            .map(|t| t.subscriber_count())
            .unwrap_or(0)
    }

    /// Get the topics a connection is subscribed to.
    #[must_use]
    pub fn connection_topics(&self, connection_id: &str) -> Vec<TopicId> {
        self.subscriptions
            .get(connection_id)
            .map(|s| s.iter().map(|t| t.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of live topics.
    pub topic_count: usize,
    /// Number of connections holding subscriptions.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}
