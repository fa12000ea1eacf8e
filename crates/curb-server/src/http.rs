//! Read-only HTTP trip API.
//!
//! Lets clients list and retrieve trips scoped to their role without
//! opening a WebSocket: drivers see open requests plus their own
//! assignments, riders see their own trips. This surface only reads the
//! store; it never touches the broadcast engine.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use curb_core::{Role, StoreError, Trip, User};
use curb_protocol::{TripSnapshot, TripStatus};
use std::sync::Arc;
use tracing::error;

use crate::handlers::AppState;

/// Routes for the trip API.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/trips", get(list_trips))
        .route("/api/trips/:nk", get(get_trip))
}

/// Resolve the caller from an `Authorization: Token <token>` header.
fn token_user(state: &AppState, headers: &HeaderMap) -> Option<User> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Token ")?;
    state.users.get(token).cloned()
}

/// Whether the caller may see this trip.
fn visible_to(user: &User, trip: &Trip) -> bool {
    if user.has_role(Role::Driver) {
        trip.status == TripStatus::Requested
            || trip.driver.as_ref().is_some_and(|d| d.id == user.id)
    } else if user.has_role(Role::Rider) {
        trip.rider.as_ref().is_some_and(|r| r.id == user.id)
    } else {
        false
    }
}

async fn list_trips(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(user) = token_user(&state, &headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let store = state.dispatcher.store();
    let result = if user.has_role(Role::Driver) {
        // Open requests plus the driver's own assignments. The two sets are
        // disjoint: a requested trip has no driver yet.
        let requested = store.query_by_status(TripStatus::Requested).await;
        let assigned = store.query_by_driver(user.id, None).await;
        match (requested, assigned) {
            (Ok(mut trips), Ok(assigned)) => {
                trips.extend(assigned);
                trips.sort_by(|a, b| a.created.cmp(&b.created));
                Ok(trips)
            }
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    } else if user.has_role(Role::Rider) {
        store.query_by_rider(user.id, None).await
    } else {
        Ok(Vec::new())
    };

    match result {
        Ok(trips) => {
            let snapshots: Vec<TripSnapshot> = trips.iter().map(Trip::snapshot).collect();
            Json(snapshots).into_response()
        }
        Err(e) => {
            error!(user = %user.username, error = %e, "Trip listing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_trip(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(nk): Path<String>,
) -> Response {
    let Some(user) = token_user(&state, &headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.dispatcher.store().get_by_nk(&nk).await {
        Ok(trip) if visible_to(&user, &trip) => Json(trip.snapshot()).into_response(),
        // Out-of-scope trips look exactly like missing ones.
        Ok(_) | Err(StoreError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(nk = %nk, error = %e, "Trip retrieval failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rider() -> User {
        User::new(1, "rider@example.com", vec![Role::Rider])
    }

    fn driver() -> User {
        User::new(2, "driver@example.com", vec![Role::Driver])
    }

    #[test]
    fn test_requested_trips_visible_to_any_driver() {
        let trip = Trip::request(rider(), "A", "B").unwrap();
        assert!(visible_to(&driver(), &trip));
        let other_driver = User::new(9, "other@example.com", vec![Role::Driver]);
        assert!(visible_to(&other_driver, &trip));
    }

    #[test]
    fn test_started_trip_visible_only_to_its_driver() {
        let mut trip = Trip::request(rider(), "A", "B").unwrap();
        trip.apply(
            &driver(),
            curb_core::TripChange {
                status: Some(TripStatus::Started),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(visible_to(&driver(), &trip));
        let other_driver = User::new(9, "other@example.com", vec![Role::Driver]);
        assert!(!visible_to(&other_driver, &trip));
    }

    #[test]
    fn test_riders_see_only_their_own_trips() {
        let trip = Trip::request(rider(), "A", "B").unwrap();
        assert!(visible_to(&rider(), &trip));
        let other_rider = User::new(8, "other@example.com", vec![Role::Rider]);
        assert!(!visible_to(&other_rider, &trip));
    }
}
