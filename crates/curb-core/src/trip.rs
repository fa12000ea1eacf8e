//! The trip entity and its state machine.
//!
//! A trip moves one way through `requested -> started -> completed`. The
//! rider is fixed at creation; the first driver to touch the trip claims it
//! and later drivers never displace them. All timestamps are
//! server-assigned.

use chrono::{DateTime, Utc};
use curb_protocol::{TripSnapshot, TripStatus};
use thiserror::Error;
use uuid::Uuid;

use crate::user::User;

/// Validation failures raised by the trip state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TripError {
    /// A required address field is empty.
    #[error("{field} must not be empty")]
    EmptyAddress {
        /// Name of the offending field.
        field: &'static str,
    },

    /// The requested status transition moves backward.
    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition {
        /// Status the trip currently holds.
        from: TripStatus,
        /// Status the update asked for.
        to: TripStatus,
    },
}

/// Generate a fresh natural key: 32 lowercase hex characters.
#[must_use]
pub fn generate_nk() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Field changes a driver may apply to a trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TripChange {
    /// New status, if changing.
    pub status: Option<TripStatus>,
    /// New pick-up address, if changing.
    pub pick_up_address: Option<String>,
    /// New drop-off address, if changing.
    pub drop_off_address: Option<String>,
}

/// A trip between a pick-up and a drop-off address.
#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    /// Natural key. Never changes once assigned.
    pub nk: String,
    /// Pick-up address.
    pub pick_up_address: String,
    /// Drop-off address.
    pub drop_off_address: String,
    /// Current status.
    pub status: TripStatus,
    /// The rider who requested the trip. Set at creation, immutable.
    pub rider: Option<User>,
    /// The driver serving the trip. Set by the first driver update.
    pub driver: Option<User>,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last update time.
    pub updated: DateTime<Utc>,
}

impl Trip {
    /// Create a new trip requested by `rider`.
    ///
    /// # Errors
    ///
    /// Returns [`TripError::EmptyAddress`] if either address is blank.
    pub fn request(rider: User, pick_up: &str, drop_off: &str) -> Result<Self, TripError> {
        validate_address("pick_up_address", pick_up)?;
        validate_address("drop_off_address", drop_off)?;

        let now = Utc::now();
        Ok(Self {
            nk: generate_nk(),
            pick_up_address: pick_up.to_string(),
            drop_off_address: drop_off.to_string(),
            status: TripStatus::Requested,
            rider: Some(rider),
            driver: None,
            created: now,
            updated: now,
        })
    }

    /// Apply a driver update.
    ///
    /// The first driver to update the trip claims it; for every later driver
    /// the existing assignment is kept and only the field changes apply.
    /// Status may stay put or move forward, never backward. Validation runs
    /// before any field is touched, so a failed update leaves the trip
    /// exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns [`TripError::IllegalTransition`] for a backward status move
    /// and [`TripError::EmptyAddress`] for a blank address.
    pub fn apply(&mut self, driver: &User, change: TripChange) -> Result<(), TripError> {
        if let Some(next) = change.status {
            if next < self.status {
                return Err(TripError::IllegalTransition {
                    from: self.status,
                    to: next,
                });
            }
        }
        if let Some(addr) = change.pick_up_address.as_deref() {
            validate_address("pick_up_address", addr)?;
        }
        if let Some(addr) = change.drop_off_address.as_deref() {
            validate_address("drop_off_address", addr)?;
        }

        if self.driver.is_none() {
            self.driver = Some(driver.clone());
        }
        if let Some(next) = change.status {
            self.status = next;
        }
        if let Some(addr) = change.pick_up_address {
            self.pick_up_address = addr;
        }
        if let Some(addr) = change.drop_off_address {
            self.drop_off_address = addr;
        }
        self.updated = Utc::now();

        Ok(())
    }

    /// Whether the trip is still in flight.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status != TripStatus::Completed
    }

    /// Canonical wire snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> TripSnapshot {
        TripSnapshot {
            nk: self.nk.clone(),
            pick_up_address: self.pick_up_address.clone(),
            drop_off_address: self.drop_off_address.clone(),
            status: self.status,
            rider: self.rider.as_ref().map(User::public),
            driver: self.driver.as_ref().map(User::public),
            created: self.created,
            updated: self.updated,
        }
    }
}

fn validate_address(field: &'static str, value: &str) -> Result<(), TripError> {
    if value.trim().is_empty() {
        return Err(TripError::EmptyAddress { field });
    }
    Ok(())
}
