//! Broadcast events.
//!
//! Every trip creation or update produces a [`TripEvent`] that is fanned out
//! to the subscribers of one topic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use curb_protocol::TripSnapshot;

use crate::topic::TopicId;

/// A unique event identifier.
pub type EventId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique event ID.
#[must_use]
pub fn generate_event_id() -> EventId {
    // Combine timestamp with atomic counter for guaranteed uniqueness
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// A trip-state event published to a topic.
///
/// Events are wrapped in `Arc` by the registry so fan-out to any number of
/// subscribers never copies the snapshot.
#[derive(Debug, Clone)]
pub struct TripEvent {
    /// Unique event identifier.
    pub id: EventId,
    /// Topic the event is published on (a trip nk or `drivers`).
    pub topic: TopicId,
    /// Trip state after the operation that produced the event.
    pub trip: TripSnapshot,
    /// When the event was created, milliseconds since the epoch.
    pub timestamp: u64,
}

impl TripEvent {
    /// Create a new event for a topic.
    #[must_use]
    pub fn new(topic: impl Into<TopicId>, trip: TripSnapshot) -> Self {
        Self {
            id: generate_event_id(),
            topic: topic.into(),
            trip,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use curb_protocol::TripStatus;

    fn snapshot() -> TripSnapshot {
        TripSnapshot {
            nk: "00000000000000000000000000000001".into(),
            pick_up_address: "A".into(),
            drop_off_address: "B".into(),
            status: TripStatus::Requested,
            rider: None,
            driver: None,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn test_event_carries_topic_and_snapshot() {
        let event = TripEvent::new("drivers", snapshot());
        assert_eq!(event.topic, "drivers");
        assert_eq!(event.trip.status, TripStatus::Requested);
    }

    #[test]
    fn test_unique_event_ids() {
        let id1 = generate_event_id();
        let id2 = generate_event_id();
        assert_ne!(id1, id2);
    }
}
