//! Dispatch orchestration.
//!
//! The dispatcher is the seam between connection handlers and the rest of
//! the engine: it persists trip operations, establishes the subscriptions
//! they imply, and fans the resulting snapshots out. Handlers never touch
//! the store or the registry directly.
//!
//! Ordering matters here: a creating rider is subscribed to the new trip's
//! topic *before* the creation broadcast goes out, so the rider observes its
//! own creation event exactly once, through the topic, never via a direct
//! reply.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use curb_protocol::{code, TripSnapshot, TripStatus};

use crate::event::TripEvent;
use crate::registry::{RegistryError, SubscriptionRegistry, TopicReceiver};
use crate::session::{ConnectionSession, SessionError};
use crate::store::{StoreError, TripStore};
use crate::topic::{TopicId, DRIVERS_TOPIC};
use crate::trip::{Trip, TripChange, TripError};
use crate::user::Role;

/// Dispatch failures. Every variant surfaces only to the initiating
/// connection; none of them leaves a partial subscription behind.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The payload or the requested transition is invalid.
    #[error(transparent)]
    Validation(#[from] TripError),

    /// Unknown trip natural key.
    #[error("Trip not found: {0}")]
    NotFound(String),

    /// The connection's role does not permit the action.
    #[error("Action requires the {required} role, connection is {actual}")]
    Unauthorized {
        /// Role the action demands.
        required: Role,
        /// Role the connection holds.
        actual: Role,
    },

    /// The session is not in a usable lifecycle state.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Subscription limit reached.
    #[error(transparent)]
    Limit(#[from] RegistryError),

    /// Durable storage failed; the operation may be retried.
    #[error("Store failure: {0}")]
    Store(String),
}

impl DispatchError {
    /// Wire error code for this failure.
    #[must_use]
    pub fn wire_code(&self) -> u16 {
        match self {
            DispatchError::Validation(_) => code::VALIDATION,
            DispatchError::NotFound(_) => code::NOT_FOUND,
            DispatchError::Unauthorized { .. } => code::UNAUTHORIZED,
            DispatchError::Session(_) => code::UNAUTHENTICATED,
            DispatchError::Limit(_) => code::LIMIT,
            DispatchError::Store(_) => code::STORE,
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(nk) => DispatchError::NotFound(nk),
            StoreError::Trip(e) => DispatchError::Validation(e),
            StoreError::Backend(msg) => DispatchError::Store(msg),
        }
    }
}

/// Orchestrates trip operations across store, registry, and sessions.
pub struct Dispatcher {
    store: Arc<dyn TripStore>,
    registry: Arc<SubscriptionRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over a store and a registry.
    #[must_use]
    pub fn new(store: Arc<dyn TripStore>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { store, registry }
    }

    /// The registry this dispatcher broadcasts through.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// The store this dispatcher persists through.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TripStore> {
        &self.store
    }

    /// Establish a freshly authenticated session's subscriptions.
    ///
    /// Queries the store for the user's non-completed trips by role and
    /// subscribes the session to each trip topic; drivers additionally join
    /// the `drivers` topic. Returns the receivers in subscription order.
    ///
    /// # Errors
    ///
    /// Fails if the session is not `AuthenticatedIdle`, the store is
    /// unavailable, or the subscription limit is hit.
    pub async fn open_session(
        &self,
        session: &mut ConnectionSession,
    ) -> Result<Vec<(TopicId, TopicReceiver)>, DispatchError> {
        let user_id = session.user().id;
        let trips = match session.role() {
            Role::Driver => {
                self.store
                    .query_by_driver(user_id, Some(TripStatus::Completed))
                    .await?
            }
            Role::Rider => {
                self.store
                    .query_by_rider(user_id, Some(TripStatus::Completed))
                    .await?
            }
        };

        let mut receivers = Vec::with_capacity(trips.len() + 1);
        for trip in &trips {
            if let Some(rx) = self.registry.subscribe(session.id(), &trip.nk)? {
                session.track_topic(trip.nk.clone());
                receivers.push((trip.nk.clone(), rx));
            }
        }

        if session.role() == Role::Driver {
            if let Some(rx) = self.registry.subscribe(session.id(), DRIVERS_TOPIC)? {
                session.track_topic(DRIVERS_TOPIC);
                receivers.push((DRIVERS_TOPIC.to_string(), rx));
            }
        }

        session.mark_subscribed()?;
        debug!(
            session = %session.id(),
            role = %session.role(),
            subscriptions = receivers.len(),
            "Session opened"
        );
        Ok(receivers)
    }

    /// Handle a rider's trip request.
    ///
    /// Persists the new trip, subscribes the rider to its topic, then
    /// broadcasts the snapshot to the trip topic and to `drivers`.
    ///
    /// # Errors
    ///
    /// Fails on validation, authorization, store, or subscription-limit
    /// errors; nothing is broadcast and no subscription is left behind.
    pub async fn handle_rider_request(
        &self,
        session: &mut ConnectionSession,
        pick_up: &str,
        drop_off: &str,
    ) -> Result<(TripSnapshot, Option<TopicReceiver>), DispatchError> {
        require_role(session, Role::Rider)?;

        let trip = Trip::request(session.user().clone(), pick_up, drop_off)?;
        let trip = self.store.create(trip).await?;

        let receiver = self.registry.subscribe(session.id(), &trip.nk)?;
        if receiver.is_some() {
            session.track_topic(trip.nk.clone());
        }

        let snapshot = trip.snapshot();
        let trip_recipients = self
            .registry
            .broadcast(&trip.nk, TripEvent::new(&trip.nk, snapshot.clone()));
        let driver_recipients = self.registry.broadcast(
            DRIVERS_TOPIC,
            TripEvent::new(DRIVERS_TOPIC, snapshot.clone()),
        );

        debug!(
            nk = %trip.nk,
            rider = %session.user().username,
            trip_recipients,
            driver_recipients,
            "Trip requested"
        );
        Ok((snapshot, receiver))
    }

    /// Handle a driver's trip update.
    ///
    /// Applies the change through the trip state machine under the store's
    /// per-key exclusion, subscribes the driver to the trip topic, and
    /// broadcasts the new snapshot to it. A completing update retires the
    /// topic afterwards.
    ///
    /// # Errors
    ///
    /// Fails on validation, authorization, unknown nk, store, or
    /// subscription-limit errors; the stored trip and the subscriptions are
    /// then unchanged.
    pub async fn handle_driver_update(
        &self,
        session: &mut ConnectionSession,
        nk: &str,
        change: TripChange,
    ) -> Result<(TripSnapshot, Option<TopicReceiver>), DispatchError> {
        require_role(session, Role::Driver)?;

        let driver = session.user().clone();
        let trip = self
            .store
            .update(nk, Box::new(move |t| t.apply(&driver, change)))
            .await?;

        let receiver = self.registry.subscribe(session.id(), nk)?;
        if receiver.is_some() {
            session.track_topic(nk);
        }

        let snapshot = trip.snapshot();
        let recipients = self
            .registry
            .broadcast(nk, TripEvent::new(nk, snapshot.clone()));

        if snapshot.status == TripStatus::Completed {
            self.registry.retire(nk);
        }

        debug!(
            nk = %nk,
            driver = %session.user().username,
            status = %snapshot.status,
            recipients,
            "Trip updated"
        );
        Ok((snapshot, receiver))
    }

    /// Tear a session down: bulk-unsubscribe and close.
    pub fn close_session(&self, session: &mut ConnectionSession) {
        self.registry.unsubscribe_all(session.id());
        session.close();
    }
}

fn require_role(session: &ConnectionSession, required: Role) -> Result<(), DispatchError> {
    if session.role() != required {
        return Err(DispatchError::Unauthorized {
            required,
            actual: session.role(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTripStore;
    use crate::user::User;

    fn rider_user() -> User {
        User::new(1, "rider@example.com", vec![Role::Rider])
    }

    fn driver_user(id: u64, username: &str) -> User {
        User::new(id, username, vec![Role::Driver])
    }

    fn dispatcher() -> (Dispatcher, Arc<MemoryTripStore>, Arc<SubscriptionRegistry>) {
        let store = Arc::new(MemoryTripStore::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        (
            Dispatcher::new(store.clone(), registry.clone()),
            store,
            registry,
        )
    }

    async fn connect(
        dispatcher: &Dispatcher,
        user: User,
        role: Role,
    ) -> (ConnectionSession, Vec<(TopicId, TopicReceiver)>) {
        let mut session = ConnectionSession::connecting(user, role);
        session.authenticate().unwrap();
        let receivers = dispatcher.open_session(&mut session).await.unwrap();
        (session, receivers)
    }

    fn started() -> TripChange {
        TripChange {
            status: Some(TripStatus::Started),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rider_receives_own_creation_event_via_topic() {
        let (dispatcher, _, _) = dispatcher();
        let (mut rider, _) = connect(&dispatcher, rider_user(), Role::Rider).await;

        let (snapshot, receiver) = dispatcher
            .handle_rider_request(&mut rider, "A", "B")
            .await
            .unwrap();

        // The subscription was established before the broadcast, so the
        // creation event is already waiting: exactly one, via the topic.
        let mut rx = receiver.expect("rider subscribed to the new trip topic");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.trip.nk, snapshot.nk);
        assert_eq!(event.trip.status, TripStatus::Requested);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_creation_broadcast_reaches_drivers_topic() {
        let (dispatcher, _, _) = dispatcher();
        let (_driver, mut driver_rxs) =
            connect(&dispatcher, driver_user(2, "driver@example.com"), Role::Driver).await;
        let (mut rider, _) = connect(&dispatcher, rider_user(), Role::Rider).await;

        let (snapshot, _) = dispatcher
            .handle_rider_request(&mut rider, "A", "B")
            .await
            .unwrap();

        let drivers_rx = driver_rxs
            .iter_mut()
            .find(|entry| entry.0 == DRIVERS_TOPIC)
            .map(|entry| &mut entry.1)
            .expect("driver joined the drivers topic at connect");

        let event = drivers_rx.try_recv().unwrap();
        assert_eq!(event.trip.nk, snapshot.nk);
        assert_eq!(event.trip.status, TripStatus::Requested);
        assert_eq!(event.trip.rider.as_ref().unwrap().id, 1);
        assert!(event.trip.driver.is_none());
    }

    #[tokio::test]
    async fn test_driver_update_broadcast_reaches_rider() {
        let (dispatcher, _, _) = dispatcher();
        let (mut rider, _) = connect(&dispatcher, rider_user(), Role::Rider).await;
        let (mut driver, _) =
            connect(&dispatcher, driver_user(2, "driver@example.com"), Role::Driver).await;

        let (snapshot, rider_rx) = dispatcher
            .handle_rider_request(&mut rider, "A", "B")
            .await
            .unwrap();
        let mut rider_rx = rider_rx.unwrap();
        rider_rx.try_recv().unwrap(); // drain the creation event

        dispatcher
            .handle_driver_update(&mut driver, &snapshot.nk, started())
            .await
            .unwrap();

        let event = rider_rx.try_recv().unwrap();
        assert_eq!(event.trip.status, TripStatus::Started);
        assert_eq!(
            event.trip.driver.as_ref().unwrap().username,
            "driver@example.com"
        );
    }

    #[tokio::test]
    async fn test_second_driver_does_not_displace_first() {
        let (dispatcher, _, _) = dispatcher();
        let (mut rider, _) = connect(&dispatcher, rider_user(), Role::Rider).await;
        let (mut first, _) =
            connect(&dispatcher, driver_user(2, "first@example.com"), Role::Driver).await;
        let (mut second, _) =
            connect(&dispatcher, driver_user(3, "second@example.com"), Role::Driver).await;

        let (snapshot, _) = dispatcher
            .handle_rider_request(&mut rider, "A", "B")
            .await
            .unwrap();

        dispatcher
            .handle_driver_update(&mut first, &snapshot.nk, started())
            .await
            .unwrap();
        let (after_second, _) = dispatcher
            .handle_driver_update(&mut second, &snapshot.nk, TripChange::default())
            .await
            .unwrap();

        assert_eq!(after_second.driver.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_errors_reach_only_initiator_and_mutate_nothing() {
        let (dispatcher, store, registry) = dispatcher();
        let (mut rider, _) = connect(&dispatcher, rider_user(), Role::Rider).await;
        let (mut driver, _) =
            connect(&dispatcher, driver_user(2, "driver@example.com"), Role::Driver).await;

        // Unknown nk.
        let err = dispatcher
            .handle_driver_update(&mut driver, "ffffffffffffffffffffffffffffffff", started())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
        assert_eq!(err.wire_code(), code::NOT_FOUND);

        // A failed update must not have subscribed the driver to anything
        // beyond its connect-time topics.
        assert_eq!(registry.connection_topics(driver.id()), vec![DRIVERS_TOPIC]);

        // Illegal transition: complete the trip, then try to restart it.
        let (snapshot, rider_rx) = dispatcher
            .handle_rider_request(&mut rider, "A", "B")
            .await
            .unwrap();
        let mut rider_rx = rider_rx.unwrap();
        dispatcher
            .handle_driver_update(
                &mut driver,
                &snapshot.nk,
                TripChange {
                    status: Some(TripStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        while rider_rx.try_recv().is_ok() {}

        let err = dispatcher
            .handle_driver_update(&mut driver, &snapshot.nk, started())
            .await
            .unwrap_err();
        assert_eq!(err.wire_code(), code::VALIDATION);

        // No broadcast followed the failure and the store kept the
        // completed state.
        assert!(rider_rx.try_recv().is_err());
        assert_eq!(
            store.get_by_nk(&snapshot.nk).await.unwrap().status,
            TripStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_validation_error_on_empty_addresses() {
        let (dispatcher, store, _) = dispatcher();
        let (mut rider, _) = connect(&dispatcher, rider_user(), Role::Rider).await;

        let err = dispatcher
            .handle_rider_request(&mut rider, "", "B")
            .await
            .unwrap_err();
        assert_eq!(err.wire_code(), code::VALIDATION);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_rider_cannot_perform_driver_update() {
        let (dispatcher, _, _) = dispatcher();
        let (mut rider, _) = connect(&dispatcher, rider_user(), Role::Rider).await;

        let err = dispatcher
            .handle_driver_update(&mut rider, "ffffffffffffffffffffffffffffffff", started())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unauthorized { .. }));
        assert_eq!(err.wire_code(), code::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_connect_subscribes_to_active_trips_only() {
        let (dispatcher, store, _) = dispatcher();

        // Two active trips and one completed, all owned by the rider.
        for _ in 0..2 {
            let trip = Trip::request(rider_user(), "A", "B").unwrap();
            store.create(trip).await.unwrap();
        }
        let mut done = Trip::request(rider_user(), "C", "D").unwrap();
        done.apply(
            &driver_user(2, "driver@example.com"),
            TripChange {
                status: Some(TripStatus::Completed),
                ..Default::default()
            },
        )
        .unwrap();
        store.create(done).await.unwrap();

        let (session, receivers) = connect(&dispatcher, rider_user(), Role::Rider).await;
        assert_eq!(receivers.len(), 2);
        assert_eq!(session.topics().len(), 2);
    }

    #[tokio::test]
    async fn test_driver_connect_resubscribes_assignments_plus_drivers() {
        let (dispatcher, store, _) = dispatcher();

        let mut trip = Trip::request(rider_user(), "A", "B").unwrap();
        trip.apply(&driver_user(2, "driver@example.com"), started())
            .unwrap();
        let trip = store.create(trip).await.unwrap();

        let (_, receivers) =
            connect(&dispatcher, driver_user(2, "driver@example.com"), Role::Driver).await;
        let topics: Vec<&str> = receivers.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics, vec![trip.nk.as_str(), DRIVERS_TOPIC]);
    }

    #[tokio::test]
    async fn test_disconnect_removes_connection_from_every_topic() {
        let (dispatcher, _, registry) = dispatcher();
        let (mut rider, _) = connect(&dispatcher, rider_user(), Role::Rider).await;

        let (snapshot, _rx) = dispatcher
            .handle_rider_request(&mut rider, "A", "B")
            .await
            .unwrap();
        assert_eq!(registry.subscriber_count(&snapshot.nk), 1);

        dispatcher.close_session(&mut rider);

        assert_eq!(registry.subscriber_count(&snapshot.nk), 0);
        // Subsequent broadcasts on the old topics deliver to nobody.
        let delivered = registry.broadcast(
            &snapshot.nk,
            TripEvent::new(&snapshot.nk, snapshot.clone()),
        );
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_completed_trip_topic_evicted_after_drain() {
        let (dispatcher, _, registry) = dispatcher();
        let (mut rider, _) = connect(&dispatcher, rider_user(), Role::Rider).await;
        let (mut driver, _) =
            connect(&dispatcher, driver_user(2, "driver@example.com"), Role::Driver).await;

        let (snapshot, _rider_rx) = dispatcher
            .handle_rider_request(&mut rider, "A", "B")
            .await
            .unwrap();
        dispatcher
            .handle_driver_update(
                &mut driver,
                &snapshot.nk,
                TripChange {
                    status: Some(TripStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Retired but still populated: the topic survives until both ends
        // disconnect.
        assert!(registry.topic_exists(&snapshot.nk));

        dispatcher.close_session(&mut rider);
        dispatcher.close_session(&mut driver);
        assert!(!registry.topic_exists(&snapshot.nk));
    }
}
