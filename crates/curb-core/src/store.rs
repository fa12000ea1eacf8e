//! Durable trip storage.
//!
//! The engine treats storage as an external collaborator with simple CRUD
//! semantics; [`TripStore`] is the seam a durable backend plugs into.
//! [`MemoryTripStore`] is the in-process implementation used by the server
//! and the tests.

use async_trait::async_trait;
use curb_protocol::TripStatus;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::trip::{Trip, TripError};

/// Mutation applied to a stored trip under the store's per-key exclusion.
pub type TripMutator = Box<dyn FnOnce(&mut Trip) -> Result<(), TripError> + Send>;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No trip with the given natural key.
    #[error("Trip not found: {0}")]
    NotFound(String),

    /// The mutator rejected the update; the stored trip is unchanged.
    #[error(transparent)]
    Trip(#[from] TripError),

    /// The backend failed.
    #[error("Store backend failure: {0}")]
    Backend(String),
}

/// Durable entity storage for trips.
///
/// Every call is atomic. Concurrent [`update`](TripStore::update) calls on
/// the same natural key serialize: implementations must never interleave
/// partial writes, so a driver/status combination observed by any reader was
/// produced by exactly one mutator.
#[async_trait]
pub trait TripStore: Send + Sync {
    /// Persist a freshly created trip.
    async fn create(&self, trip: Trip) -> Result<Trip, StoreError>;

    /// Fetch a trip by natural key.
    async fn get_by_nk(&self, nk: &str) -> Result<Trip, StoreError>;

    /// Atomically mutate the trip stored under `nk` and return the new
    /// snapshot. A failed mutator leaves the stored trip untouched.
    async fn update(&self, nk: &str, mutator: TripMutator) -> Result<Trip, StoreError>;

    /// Trips assigned to the driver, optionally excluding one status.
    async fn query_by_driver(
        &self,
        driver_id: u64,
        exclude: Option<TripStatus>,
    ) -> Result<Vec<Trip>, StoreError>;

    /// Trips owned by the rider, optionally excluding one status.
    async fn query_by_rider(
        &self,
        rider_id: u64,
        exclude: Option<TripStatus>,
    ) -> Result<Vec<Trip>, StoreError>;

    /// All trips currently in the given status.
    async fn query_by_status(&self, status: TripStatus) -> Result<Vec<Trip>, StoreError>;
}

/// In-memory trip store keyed by natural key.
#[derive(Debug, Default)]
pub struct MemoryTripStore {
    trips: DashMap<String, Trip>,
}

impl MemoryTripStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored trips.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trips.len()
    }

    /// Whether the store holds no trips.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }

    fn collect_sorted<F>(&self, filter: F) -> Vec<Trip>
    where
        F: Fn(&Trip) -> bool,
    {
        let mut trips: Vec<Trip> = self
            .trips
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        trips.sort_by(|a, b| a.created.cmp(&b.created));
        trips
    }
}

#[async_trait]
impl TripStore for MemoryTripStore {
    async fn create(&self, trip: Trip) -> Result<Trip, StoreError> {
        debug!(nk = %trip.nk, "Storing new trip");
        self.trips.insert(trip.nk.clone(), trip.clone());
        Ok(trip)
    }

    async fn get_by_nk(&self, nk: &str) -> Result<Trip, StoreError> {
        self.trips
            .get(nk)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(nk.to_string()))
    }

    async fn update(&self, nk: &str, mutator: TripMutator) -> Result<Trip, StoreError> {
        // The entry guard serializes writers on this key. The mutator runs
        // on a scratch copy; the stored trip only changes on success.
        let mut entry = self
            .trips
            .get_mut(nk)
            .ok_or_else(|| StoreError::NotFound(nk.to_string()))?;

        let mut scratch = entry.value().clone();
        mutator(&mut scratch)?;
        *entry.value_mut() = scratch.clone();

        debug!(nk = %nk, status = %scratch.status, "Updated trip");
        Ok(scratch)
    }

    async fn query_by_driver(
        &self,
        driver_id: u64,
        exclude: Option<TripStatus>,
    ) -> Result<Vec<Trip>, StoreError> {
        Ok(self.collect_sorted(|trip| {
            exclude != Some(trip.status)
                && trip.driver.as_ref().is_some_and(|d| d.id == driver_id)
        }))
    }

    async fn query_by_rider(
        &self,
        rider_id: u64,
        exclude: Option<TripStatus>,
    ) -> Result<Vec<Trip>, StoreError> {
        Ok(self.collect_sorted(|trip| {
            exclude != Some(trip.status)
                && trip.rider.as_ref().is_some_and(|r| r.id == rider_id)
        }))
    }

    async fn query_by_status(&self, status: TripStatus) -> Result<Vec<Trip>, StoreError> {
        Ok(self.collect_sorted(|trip| trip.status == status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trip::TripChange;
    use crate::user::{Role, User};
    use std::sync::Arc;

    fn rider() -> User {
        User::new(1, "rider@example.com", vec![Role::Rider])
    }

    fn driver() -> User {
        User::new(2, "driver@example.com", vec![Role::Driver])
    }

    async fn stored_trip(store: &MemoryTripStore) -> Trip {
        let trip = Trip::request(rider(), "A", "B").unwrap();
        store.create(trip).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryTripStore::new();
        let trip = stored_trip(&store).await;

        let fetched = store.get_by_nk(&trip.nk).await.unwrap();
        assert_eq!(fetched, trip);

        assert!(matches!(
            store.get_by_nk("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_applies_mutator() {
        let store = MemoryTripStore::new();
        let trip = stored_trip(&store).await;
        let d = driver();

        let updated = store
            .update(
                &trip.nk,
                Box::new(move |t| {
                    t.apply(
                        &d,
                        TripChange {
                            status: Some(TripStatus::Started),
                            ..Default::default()
                        },
                    )
                }),
            )
            .await
            .unwrap();

        assert_eq!(updated.status, TripStatus::Started);
        assert_eq!(
            store.get_by_nk(&trip.nk).await.unwrap().status,
            TripStatus::Started
        );
    }

    #[tokio::test]
    async fn test_failed_mutator_leaves_store_unchanged() {
        let store = MemoryTripStore::new();
        let trip = stored_trip(&store).await;
        let d = driver();

        store
            .update(
                &trip.nk,
                Box::new({
                    let d = d.clone();
                    move |t| {
                        t.apply(
                            &d,
                            TripChange {
                                status: Some(TripStatus::Completed),
                                ..Default::default()
                            },
                        )
                    }
                }),
            )
            .await
            .unwrap();

        let err = store
            .update(
                &trip.nk,
                Box::new(move |t| {
                    t.apply(
                        &d,
                        TripChange {
                            status: Some(TripStatus::Requested),
                            ..Default::default()
                        },
                    )
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::Trip(TripError::IllegalTransition { .. })
        ));
        assert_eq!(
            store.get_by_nk(&trip.nk).await.unwrap().status,
            TripStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_role_queries_exclude_status() {
        let store = MemoryTripStore::new();
        let active = stored_trip(&store).await;
        let finished = stored_trip(&store).await;
        let d = driver();

        for nk in [&active.nk, &finished.nk] {
            let d = d.clone();
            store
                .update(
                    nk,
                    Box::new(move |t| {
                        t.apply(
                            &d,
                            TripChange {
                                status: Some(TripStatus::Started),
                                ..Default::default()
                            },
                        )
                    }),
                )
                .await
                .unwrap();
        }
        store
            .update(
                &finished.nk,
                Box::new({
                    let d = d.clone();
                    move |t| {
                        t.apply(
                            &d,
                            TripChange {
                                status: Some(TripStatus::Completed),
                                ..Default::default()
                            },
                        )
                    }
                }),
            )
            .await
            .unwrap();

        let as_driver = store
            .query_by_driver(d.id, Some(TripStatus::Completed))
            .await
            .unwrap();
        assert_eq!(as_driver.len(), 1);
        assert_eq!(as_driver[0].nk, active.nk);

        let unfiltered = store.query_by_driver(d.id, None).await.unwrap();
        assert_eq!(unfiltered.len(), 2);

        let as_rider = store
            .query_by_rider(1, Some(TripStatus::Completed))
            .await
            .unwrap();
        assert_eq!(as_rider.len(), 1);

        let requested = store.query_by_status(TripStatus::Requested).await.unwrap();
        assert!(requested.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_serialize() {
        let store = Arc::new(MemoryTripStore::new());
        let trip = stored_trip(&store).await;

        let mut handles = Vec::new();
        for id in 0..8u64 {
            let store = Arc::clone(&store);
            let nk = trip.nk.clone();
            handles.push(tokio::spawn(async move {
                let d = User::new(100 + id, format!("driver{id}@example.com"), vec![Role::Driver]);
                store
                    .update(
                        &nk,
                        Box::new(move |t| {
                            t.apply(
                                &d,
                                TripChange {
                                    status: Some(TripStatus::Started),
                                    ..Default::default()
                                },
                            )
                        }),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Exactly one driver won the assignment and the state is coherent.
        let stored = store.get_by_nk(&trip.nk).await.unwrap();
        assert_eq!(stored.status, TripStatus::Started);
        let winner = stored.driver.unwrap().id;
        assert!((100..108).contains(&winner));
    }
}
